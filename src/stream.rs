//! The output instruction stream.
//!
//! An append-only list of entries, each a 32-bit instruction word, a data
//! word, or a label definition, tagged with its segment and an optional
//! relocation against a symbolic label. The external object writer / JIT
//! loader resolves labels to addresses and patches the relocated fields; the
//! stream itself never computes addresses.
//!
//! The only rewriting the stream performs is duplicate-MOV suppression: a
//! `mov xd, xs` identical to the immediately preceding instruction is
//! dropped, unless flagged `nopeep`.

use crate::fx::FxHashMap;
use crate::isa::aarch64::Inst;

use log::trace;

/// Output segment an entry belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Segment {
    Text,
    RoData,
    Data,
}

/// Relocation kinds understood by the external writer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reloc {
    None,
    /// `bl` 26-bit PC-relative.
    BlPcrel26,
    /// `b` 26-bit PC-relative.
    BranchPcrel26,
    /// `b.cond` 19-bit PC-relative.
    CondBrPcrel19,
    /// `adrp` 21-bit page-relative.
    AdrpPcrel21,
    /// `add` low 12 bits of the target address.
    AddLo12,
    /// `movz` absolute bits 0..16.
    AbsLo16,
    /// `movk` absolute bits 16..32.
    AbsHi16,
    /// 64-bit absolute pointer, used only from within data.
    Abs64,
}

/// The payload of one stream entry.
#[derive(Clone, Debug, PartialEq)]
pub enum EntryKind {
    Instruction { word: u32 },
    Data32 { value: u32 },
    Data64 { value: u64 },
    Label,
}

/// One entry in the stream.
#[derive(Clone, Debug)]
pub struct StreamEntry {
    pub kind: EntryKind,
    /// Assembly-listing text for the entry.
    pub text: String,
    pub segment: Segment,
    /// Label defined at this position, if any.
    pub label_def: Option<String>,
    /// Symbolic target for the relocation.
    pub target: Option<String>,
    pub reloc: Reloc,
    /// Exempt from peephole rewriting.
    pub nopeep: bool,
}

impl StreamEntry {
    pub fn is_data_value(&self) -> bool {
        matches!(self.kind, EntryKind::Data32 { .. } | EntryKind::Data64 { .. })
    }
}

/// The instruction stream and its label manager.
#[derive(Debug, Default)]
pub struct InstructionStream {
    entries: Vec<StreamEntry>,
    label_positions: FxHashMap<String, usize>,
    next_label_id: u32,
}

impl InstructionStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invent a fresh internal label.
    pub fn new_label(&mut self, prefix: &str) -> String {
        let name = format!("L_{}{}", prefix, self.next_label_id);
        self.next_label_id += 1;
        name
    }

    /// Bind `name` to the current position in `segment`.
    pub fn define_label(&mut self, name: &str, segment: Segment) {
        trace!("define label {name}");
        self.label_positions.insert(name.to_string(), self.entries.len());
        self.entries.push(StreamEntry {
            kind: EntryKind::Label,
            text: format!("{name}:"),
            segment,
            label_def: Some(name.to_string()),
            target: None,
            reloc: Reloc::None,
            nopeep: false,
        });
    }

    pub fn label_is_defined(&self, name: &str) -> bool {
        self.label_positions.contains_key(name)
    }

    /// Append an instruction, applying duplicate-MOV suppression.
    pub fn push_inst(&mut self, inst: &Inst, segment: Segment) {
        let text = inst.print();
        if !inst.is_nopeep() && self.is_duplicate_mov(&text) {
            trace!("peephole dropped duplicate {text}");
            return;
        }
        let (target, reloc) = match inst.reloc() {
            Some((t, r)) => (Some(t), r),
            None => (None, Reloc::None),
        };
        self.entries.push(StreamEntry {
            kind: EntryKind::Instruction {
                word: inst.encode(),
            },
            text,
            segment,
            label_def: None,
            target,
            reloc,
            nopeep: inst.is_nopeep(),
        });
    }

    /// Append a sequence of instructions.
    pub fn push_insts(&mut self, insts: &[Inst], segment: Segment) {
        for inst in insts {
            self.push_inst(inst, segment);
        }
    }

    fn is_duplicate_mov(&self, text: &str) -> bool {
        if !text.starts_with("mov ") {
            return false;
        }
        match self.entries.last() {
            Some(prev) => {
                matches!(prev.kind, EntryKind::Instruction { .. })
                    && !prev.nopeep
                    && prev.text == text
            }
            None => false,
        }
    }

    /// Append a raw 32-bit data word.
    pub fn add_data32(&mut self, value: u32, segment: Segment) {
        self.entries.push(StreamEntry {
            kind: EntryKind::Data32 { value },
            text: format!(".word {value:#x}"),
            segment,
            label_def: None,
            target: None,
            reloc: Reloc::None,
            nopeep: false,
        });
    }

    /// Append a raw 64-bit data word.
    pub fn add_data64(&mut self, value: u64, segment: Segment) {
        self.entries.push(StreamEntry {
            kind: EntryKind::Data64 { value },
            text: format!(".quad {value:#x}"),
            segment,
            label_def: None,
            target: None,
            reloc: Reloc::None,
            nopeep: false,
        });
    }

    /// Append a 64-bit pointer slot relocated against `label`.
    pub fn add_data64_reloc(&mut self, label: &str, segment: Segment) {
        self.entries.push(StreamEntry {
            kind: EntryKind::Data64 { value: 0 },
            text: format!(".quad {label}"),
            segment,
            label_def: None,
            target: Some(label.to_string()),
            reloc: Reloc::Abs64,
            nopeep: false,
        });
    }

    pub fn entries(&self) -> &[StreamEntry] {
        &self.entries
    }

    pub fn entries_in(&self, segment: Segment) -> impl Iterator<Item = &StreamEntry> {
        self.entries.iter().filter(move |e| e.segment == segment)
    }

    /// Assembly texts of the instructions in `segment`, labels included.
    /// Primarily for tests and trace listings.
    pub fn listing(&self, segment: Segment) -> Vec<String> {
        self.entries_in(segment).map(|e| e.text.clone()).collect()
    }

    /// Instruction texts between the definition of `label` and the next
    /// label definition in the same segment.
    pub fn listing_after_label(&self, label: &str) -> Vec<String> {
        let Some(&start) = self.label_positions.get(label) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for entry in &self.entries[start + 1..] {
            if entry.label_def.is_some() {
                break;
            }
            out.push(entry.text.clone());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::aarch64::regs::xreg;

    #[test]
    fn duplicate_mov_suppression() {
        let mut stream = InstructionStream::new();
        stream.push_inst(&Inst::mov(xreg(0), xreg(1)), Segment::Text);
        stream.push_inst(&Inst::mov(xreg(0), xreg(1)), Segment::Text);
        assert_eq!(stream.entries().len(), 1);
        // A different MOV still lands.
        stream.push_inst(&Inst::mov(xreg(2), xreg(1)), Segment::Text);
        assert_eq!(stream.entries().len(), 2);
    }

    #[test]
    fn nopeep_exempts_the_duplicate() {
        let mut stream = InstructionStream::new();
        stream.push_inst(&Inst::mov(xreg(0), xreg(1)), Segment::Text);
        stream.push_inst(
            &Inst::MovRR {
                rd: xreg(0),
                rm: xreg(1),
                nopeep: true,
            },
            Segment::Text,
        );
        assert_eq!(stream.entries().len(), 2);
    }

    #[test]
    fn labels_and_listing() {
        let mut stream = InstructionStream::new();
        stream.define_label("f", Segment::Text);
        stream.push_inst(&Inst::Ret, Segment::Text);
        stream.define_label("g", Segment::Text);
        assert!(stream.label_is_defined("f"));
        assert_eq!(stream.listing_after_label("f"), vec!["ret".to_string()]);
    }

    #[test]
    fn bl_reloc_recorded() {
        let mut stream = InstructionStream::new();
        stream.push_inst(
            &Inst::Bl {
                target: "veneer_WRITES".into(),
            },
            Segment::Text,
        );
        let entry = &stream.entries()[0];
        assert_eq!(entry.reloc, Reloc::BlPcrel26);
        assert_eq!(entry.target.as_deref(), Some("veneer_WRITES"));
    }

    #[test]
    fn fresh_labels_are_unique() {
        let mut stream = InstructionStream::new();
        let a = stream.new_label("epilogue_");
        let b = stream.new_label("epilogue_");
        assert_ne!(a, b);
    }
}
