//! Target description and memory map XML.

use bitprobe::config::MemoryRegion;
use bitprobe::core::{CoreKind, CoreRegister};

/// The target description advertised through `qXfer:features:read`.
pub fn target_xml(kind: CoreKind, registers: &[CoreRegister]) -> String {
    let feature = match kind {
        CoreKind::CortexM => "org.gnu.gdb.arm.m-profile",
        CoreKind::CortexA | CoreKind::CortexR => "org.gnu.gdb.arm.core",
        CoreKind::Riscv32 => "org.gnu.gdb.riscv.cpu",
    };

    let mut xml = String::with_capacity(1024);
    xml.push_str(r#"<?xml version="1.0"?>"#);
    xml.push_str(r#"<!DOCTYPE target SYSTEM "gdb-target.dtd">"#);
    xml.push_str(r#"<target version="1.0">"#);
    xml.push_str("<architecture>");
    xml.push_str(kind.gdb_arch());
    xml.push_str("</architecture>");
    xml.push_str(&format!(r#"<feature name="{feature}">"#));

    for register in registers {
        let reg_type = match register.name {
            "pc" => r#" type="code_ptr""#,
            "sp" | "msp" | "psp" => r#" type="data_ptr""#,
            _ => "",
        };
        xml.push_str(&format!(
            r#"<reg name="{}" bitsize="{}"{}/>"#,
            register.name, register.bits, reg_type
        ));
    }

    xml.push_str("</feature></target>");
    xml
}

/// The memory map advertised through `qXfer:memory-map:read`: one entry per
/// RAM region, one flash entry with its erase block size per NVM region.
pub fn memory_map_xml(regions: &[MemoryRegion]) -> String {
    let mut xml = String::with_capacity(512);
    xml.push_str(r#"<?xml version="1.0"?>"#);
    xml.push_str(r#"<!DOCTYPE memory-map PUBLIC "+//IDN gnu.org//DTD GDB Memory Map V1.0//EN" "http://sourceware.org/gdb/gdb-memory-map.dtd">"#);
    xml.push_str("<memory-map>");

    for region in regions {
        match region {
            MemoryRegion::Ram(ram) => {
                xml.push_str(&format!(
                    r#"<memory type="ram" start="{:#x}" length="{:#x}"/>"#,
                    ram.start, ram.length
                ));
            }
            MemoryRegion::Nvm(nvm) => {
                xml.push_str(&format!(
                    r#"<memory type="flash" start="{:#x}" length="{:#x}"><property name="blocksize">{:#x}</property></memory>"#,
                    nvm.start, nvm.length, nvm.block_size
                ));
            }
        }
    }

    xml.push_str("</memory-map>");
    xml
}

/// Cut the `qXfer` read window out of a document: `m` prefix when more
/// follows, `l` prefix for the final chunk.
pub fn xfer_window(document: &[u8], offset: u32, length: u32) -> Vec<u8> {
    let offset = offset as usize;
    let length = length as usize;

    if offset >= document.len() {
        return b"l".to_vec();
    }

    let end = (offset + length).min(document.len());
    let mut window = Vec::with_capacity(end - offset + 1);
    window.push(if end < document.len() { b'm' } else { b'l' });
    window.extend_from_slice(&document[offset..end]);
    window
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitprobe::config::{NvmRegion, RamRegion};

    #[test]
    fn memory_map_for_an_f103c8() {
        let regions = vec![
            MemoryRegion::Ram(RamRegion {
                start: 0x2000_0000,
                length: 0x5000,
            }),
            MemoryRegion::Nvm(NvmRegion {
                start: 0x0800_0000,
                length: 0x1_0000,
                block_size: 0x400,
                write_size: 0x400,
                erased_byte: 0xFF,
            }),
        ];

        let xml = memory_map_xml(&regions);
        assert!(xml.contains(r#"<memory type="ram" start="0x20000000" length="0x5000"/>"#));
        assert!(xml.contains(
            r#"<memory type="flash" start="0x8000000" length="0x10000"><property name="blocksize">0x400</property></memory>"#
        ));
    }

    #[test]
    fn xfer_windowing() {
        let doc = b"0123456789";
        assert_eq!(xfer_window(doc, 0, 4), b"m0123".to_vec());
        assert_eq!(xfer_window(doc, 4, 100), b"l456789".to_vec());
        assert_eq!(xfer_window(doc, 100, 4), b"l".to_vec());
        assert_eq!(xfer_window(doc, 0, 10), b"l0123456789".to_vec());
    }

    #[test]
    fn target_xml_names_every_register() {
        let registers = [
            CoreRegister {
                name: "r0",
                id: bitprobe::RegisterId(0),
                bits: 32,
            },
            CoreRegister {
                name: "pc",
                id: bitprobe::RegisterId(1),
                bits: 32,
            },
        ];
        let xml = target_xml(CoreKind::CortexM, &registers);
        assert!(xml.contains("<architecture>arm</architecture>"));
        assert!(xml.contains(r#"<reg name="r0" bitsize="32"/>"#));
        assert!(xml.contains(r#"<reg name="pc" bitsize="32" type="code_ptr"/>"#));
    }
}
