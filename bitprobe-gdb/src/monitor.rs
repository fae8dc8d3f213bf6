//! The `qRcmd` monitor command line.
//!
//! GDB's `monitor` escape hatches into probe-local commands: rescans,
//! clock control and status queries. Console output goes back as `O`
//! packets; the final reply is `OK` or an error code.

use bitprobe::Session;

/// What a monitor command produced.
pub struct MonitorOutcome {
    /// Console lines to stream back to the user.
    pub console: Vec<String>,
    /// `Ok` for a final `OK`, `Err` with the literal error reply otherwise.
    pub result: Result<(), String>,
}

impl MonitorOutcome {
    fn ok(console: Vec<String>) -> Self {
        Self {
            console,
            result: Ok(()),
        }
    }

    fn failed(console: Vec<String>) -> Self {
        Self {
            console,
            result: Err("E01".to_string()),
        }
    }
}

/// Execute one monitor command line.
pub fn execute(session: &mut Session, line: &str) -> MonitorOutcome {
    let mut words = line.split_whitespace();
    let command = words.next().unwrap_or("");
    let argument = words.next();

    match command {
        "help" => MonitorOutcome::ok(vec![
            "Supported commands:".to_string(),
            "  swdp_scan      - scan the wire for SWD targets".to_string(),
            "  jtag_scan      - scan the JTAG chain for targets".to_string(),
            "  targets        - list attached targets".to_string(),
            "  frequency [hz] - set the wire clock (0 = fastest)".to_string(),
            "  morse          - show the last fault".to_string(),
            "  reset          - reset the attached target".to_string(),
            "  tpwr [0|1]     - control target power".to_string(),
            "  traceswo       - arm SWO capture".to_string(),
        ]),

        "swdp_scan" | "jtag_scan" => scan(session),

        "targets" => {
            let console = list_targets(session);
            MonitorOutcome::ok(console)
        }

        "frequency" => match argument.map(str::parse::<u32>) {
            Some(Ok(hz)) => {
                session.set_frequency(hz);
                let describe = if hz == 0 {
                    "fastest".to_string()
                } else {
                    format!("{hz} Hz")
                };
                MonitorOutcome::ok(vec![format!("Clock set to {describe}")])
            }
            Some(Err(_)) => MonitorOutcome::failed(vec!["Usage: frequency [hz]".to_string()]),
            None => MonitorOutcome::ok(vec!["Usage: frequency [hz]".to_string()]),
        },

        "morse" => match session.fault() {
            Some(fault) => MonitorOutcome::ok(vec![fault.to_string()]),
            None => MonitorOutcome::ok(vec!["No fault recorded".to_string()]),
        },

        "reset" => {
            // Hard reset over the wire, then a rescan to re-fetch the state
            // the reset invalidated.
            session.pulse_reset();
            match session.rescan() {
                Ok(()) => MonitorOutcome::ok(vec!["Target reset".to_string()]),
                Err(error) => MonitorOutcome::failed(vec![format!("Reset failed: {error}")]),
            }
        }

        "tpwr" => MonitorOutcome::ok(vec![
            "Target power control is not available on this platform".to_string(),
        ]),

        "traceswo" => MonitorOutcome::ok(vec![
            "SWO capture is not available on this build".to_string(),
        ]),

        other => MonitorOutcome::failed(vec![format!(
            "Unknown command '{other}'; try 'monitor help'"
        )]),
    }
}

fn scan(session: &mut Session) -> MonitorOutcome {
    match session.rescan() {
        Ok(()) => {
            let mut console = vec![format!("Scanning via {}", session.protocol_name())];
            console.extend(list_targets(session));
            if session.targets().is_empty() {
                MonitorOutcome::failed(console)
            } else {
                MonitorOutcome::ok(console)
            }
        }
        Err(error) => {
            session.set_fault(error.to_string());
            MonitorOutcome::failed(vec![format!("Scan failed: {error}")])
        }
    }
}

fn list_targets(session: &Session) -> Vec<String> {
    if session.targets().is_empty() {
        return vec!["No targets".to_string()];
    }

    session
        .targets()
        .iter()
        .enumerate()
        .map(|(index, target)| {
            format!(
                "{:2}  {:10} {}",
                index + 1,
                target.kind.as_str(),
                target.name
            )
        })
        .collect()
}
