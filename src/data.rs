//! Static data emission: the string/float/pair/quad/table/list pools,
//! vtables, and the writable globals segment.
//!
//! Every pool interns by value, so identical literals share one label no
//! matter how many functions mention them. Strings are stored as UTF-32 with
//! a leading 64-bit code-point count, padded to 8-byte alignment. List
//! literals are interned under a canonical serialization of their shape and
//! emitted as linked node records; vtables are pointer arrays in blueprint
//! order; globals occupy one word each after the `L__data_segment_base`
//! anchor.

use crate::analysis::consteval::evaluate_constant_expression;
use crate::ast::Expr;
use crate::classes::ClassTable;
use crate::fx::FxHashMap;
use crate::stream::{InstructionStream, Segment};

use log::{debug, trace};

/// Label of the anchor that opens the writable data segment.
pub const DATA_SEGMENT_BASE_LABEL: &str = "L__data_segment_base";

// List node type tags, shared with the runtime's list representation.
pub const ATOM_SENTINEL: u32 = 0;
pub const ATOM_INT: u32 = 1;
pub const ATOM_FLOAT: u32 = 2;
pub const ATOM_STRING: u32 = 3;
pub const ATOM_LIST_POINTER: u32 = 4;
pub const ATOM_PAIR: u32 = 5;

#[derive(Debug)]
struct ListNode {
    type_tag: u32,
    value_bits: u64,
    /// Label the value field points at, for string/list payloads.
    value_ptr_label: Option<String>,
}

#[derive(Debug)]
struct ListLiteral {
    header_label: String,
    nodes: Vec<ListNode>,
}

/// The data generator. Populated lazily by the class pass and the code
/// generator; emitted once after all code.
#[derive(Debug, Default)]
pub struct DataGenerator {
    string_labels: FxHashMap<String, String>,
    string_literals: Vec<(String, Vec<u32>)>,
    next_string_id: usize,

    float_labels: FxHashMap<u64, String>,
    float_literals: Vec<(String, f64)>,
    next_float_id: usize,

    pair_labels: FxHashMap<(i64, i64), String>,
    pair_literals: Vec<(String, i64, i64)>,
    next_pair_id: usize,

    quad_labels: FxHashMap<(i64, i64, i64, i64), String>,
    quad_literals: Vec<(String, [i64; 4])>,
    next_quad_id: usize,

    table_literals: Vec<(String, Vec<i64>)>,
    next_table_id: usize,
    float_table_literals: Vec<(String, Vec<f64>)>,
    next_float_table_id: usize,

    list_labels: FxHashMap<String, String>,
    list_literals: Vec<ListLiteral>,
    next_list_id: usize,

    globals: Vec<(String, i64)>,
    global_word_offsets: FxHashMap<String, usize>,
}

impl DataGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Pools

    /// Intern a string literal; returns its rodata label.
    pub fn add_string_literal(&mut self, value: &str) -> String {
        if let Some(label) = self.string_labels.get(value) {
            return label.clone();
        }
        let label = format!("L_str{}", self.next_string_id);
        self.next_string_id += 1;
        let utf32: Vec<u32> = value.chars().map(|c| c as u32).collect();
        self.string_labels.insert(value.to_string(), label.clone());
        self.string_literals.push((label.clone(), utf32));
        trace!("interned string literal as {label}");
        label
    }

    pub fn add_float_literal(&mut self, value: f64) -> String {
        let key = value.to_bits();
        if let Some(label) = self.float_labels.get(&key) {
            return label.clone();
        }
        let label = format!("L_flt{}", self.next_float_id);
        self.next_float_id += 1;
        self.float_labels.insert(key, label.clone());
        self.float_literals.push((label.clone(), value));
        label
    }

    pub fn add_pair_literal(&mut self, first: i64, second: i64) -> String {
        if let Some(label) = self.pair_labels.get(&(first, second)) {
            return label.clone();
        }
        let label = format!("L_pair{}", self.next_pair_id);
        self.next_pair_id += 1;
        self.pair_labels.insert((first, second), label.clone());
        self.pair_literals.push((label.clone(), first, second));
        label
    }

    pub fn add_quad_literal(&mut self, values: [i64; 4]) -> String {
        let key = (values[0], values[1], values[2], values[3]);
        if let Some(label) = self.quad_labels.get(&key) {
            return label.clone();
        }
        let label = format!("L_quad{}", self.next_quad_id);
        self.next_quad_id += 1;
        self.quad_labels.insert(key, label.clone());
        self.quad_literals.push((label.clone(), values));
        label
    }

    pub fn add_table_literal(&mut self, values: Vec<i64>) -> String {
        let label = format!("L_tbl{}", self.next_table_id);
        self.next_table_id += 1;
        self.table_literals.push((label.clone(), values));
        label
    }

    pub fn add_float_table_literal(&mut self, values: Vec<f64>) -> String {
        let label = format!("L_ftbl{}", self.next_float_table_id);
        self.next_float_table_id += 1;
        self.float_table_literals.push((label.clone(), values));
        label
    }

    /// Intern a list literal; identical literals share one template.
    pub fn add_list_literal(
        &mut self,
        items: &[Expr],
        manifests: &FxHashMap<String, i64>,
    ) -> String {
        let key = canonical_list_key(items, manifests);
        if let Some(label) = self.list_labels.get(&key) {
            return label.clone();
        }
        let header_label = format!("L_list{}", self.next_list_id);
        self.next_list_id += 1;

        let mut nodes = Vec::with_capacity(items.len());
        for item in items {
            nodes.push(self.list_node_for(item, manifests));
        }
        self.list_labels.insert(key, header_label.clone());
        self.list_literals.push(ListLiteral {
            header_label: header_label.clone(),
            nodes,
        });
        trace!("interned list literal as {header_label}");
        header_label
    }

    fn list_node_for(&mut self, item: &Expr, manifests: &FxHashMap<String, i64>) -> ListNode {
        match item {
            Expr::Float(f) => ListNode {
                type_tag: ATOM_FLOAT,
                value_bits: f.to_bits(),
                value_ptr_label: None,
            },
            Expr::StringLit(s) => {
                let label = self.add_string_literal(s);
                ListNode {
                    type_tag: ATOM_STRING,
                    value_bits: 0,
                    value_ptr_label: Some(label),
                }
            }
            Expr::List { items, .. } => {
                let label = self.add_list_literal(items, manifests);
                ListNode {
                    type_tag: ATOM_LIST_POINTER,
                    value_bits: 0,
                    value_ptr_label: Some(label),
                }
            }
            Expr::Pair { first, second } => {
                let a = evaluate_constant_expression(first, manifests).unwrap_or(0);
                let b = evaluate_constant_expression(second, manifests).unwrap_or(0);
                ListNode {
                    type_tag: ATOM_PAIR,
                    value_bits: pack_pair(a, b),
                    value_ptr_label: None,
                }
            }
            other => {
                let value = evaluate_constant_expression(other, manifests).unwrap_or(0);
                ListNode {
                    type_tag: ATOM_INT,
                    value_bits: value as u64,
                    value_ptr_label: None,
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Globals

    /// Register a global variable word with its folded initial value.
    pub fn add_global_variable(&mut self, name: &str, initial: i64) {
        if self.global_word_offsets.contains_key(name) {
            return;
        }
        self.global_word_offsets
            .insert(name.to_string(), self.globals.len());
        self.globals.push((name.to_string(), initial));
    }

    pub fn is_global_variable(&self, name: &str) -> bool {
        self.global_word_offsets.contains_key(name)
    }

    /// Word index of a global, relative to `L__data_segment_base`.
    pub fn global_word_offset(&self, name: &str) -> Option<usize> {
        self.global_word_offsets.get(name).copied()
    }

    // ------------------------------------------------------------------
    // Section emission

    /// Emit the read-only data section: strings, floats, pairs, quads,
    /// tables, list templates, and one vtable per class.
    pub fn generate_rodata_section(&self, stream: &mut InstructionStream, classes: &ClassTable) {
        let seg = Segment::RoData;
        for (label, utf32) in &self.string_literals {
            stream.define_label(label, seg);
            stream.add_data64(utf32.len() as u64, seg);
            for cp in utf32 {
                stream.add_data32(*cp, seg);
            }
            if utf32.len() % 2 != 0 {
                stream.add_data32(0, seg);
            }
        }
        for (label, value) in &self.float_literals {
            stream.define_label(label, seg);
            stream.add_data64(value.to_bits(), seg);
        }
        for (label, first, second) in &self.pair_literals {
            stream.define_label(label, seg);
            stream.add_data64(pack_pair(*first, *second), seg);
        }
        for (label, values) in &self.quad_literals {
            stream.define_label(label, seg);
            stream.add_data64(pack_pair(values[0], values[1]), seg);
            stream.add_data64(pack_pair(values[2], values[3]), seg);
        }
        for (label, values) in &self.table_literals {
            stream.define_label(label, seg);
            stream.add_data64(values.len() as u64, seg);
            for v in values {
                stream.add_data64(*v as u64, seg);
            }
        }
        for (label, values) in &self.float_table_literals {
            stream.define_label(label, seg);
            stream.add_data64(values.len() as u64, seg);
            for v in values {
                stream.add_data64(v.to_bits(), seg);
            }
        }
        for list in &self.list_literals {
            self.emit_list_literal(stream, list);
        }
        self.emit_vtables(stream, classes);
        debug!("rodata emitted");
    }

    fn emit_list_literal(&self, stream: &mut InstructionStream, list: &ListLiteral) {
        let seg = Segment::RoData;
        let node_label = |i: usize| format!("{}_node{}", list.header_label, i);

        // Header: tag, pad, tail pointer, head pointer, length.
        stream.define_label(&list.header_label, seg);
        stream.add_data32(ATOM_SENTINEL, seg);
        stream.add_data32(0, seg);
        if list.nodes.is_empty() {
            stream.add_data64(0, seg);
            stream.add_data64(0, seg);
        } else {
            stream.add_data64_reloc(&node_label(list.nodes.len() - 1), seg);
            stream.add_data64_reloc(&node_label(0), seg);
        }
        stream.add_data64(list.nodes.len() as u64, seg);

        // Nodes: tag, pad, value, next.
        for (i, node) in list.nodes.iter().enumerate() {
            stream.define_label(&node_label(i), seg);
            stream.add_data32(node.type_tag, seg);
            stream.add_data32(0, seg);
            match &node.value_ptr_label {
                Some(label) => stream.add_data64_reloc(label, seg),
                None => stream.add_data64(node.value_bits, seg),
            }
            if i + 1 < list.nodes.len() {
                stream.add_data64_reloc(&node_label(i + 1), seg);
            } else {
                stream.add_data64(0, seg);
            }
        }
    }

    /// One pointer table per class, in blueprint order; empty reserved slots
    /// emit a zero word.
    fn emit_vtables(&self, stream: &mut InstructionStream, classes: &ClassTable) {
        let seg = Segment::RoData;
        for name in classes.class_names_sorted() {
            let entry = classes.get_class(&name).unwrap();
            if !entry.is_layout_finalized {
                continue;
            }
            stream.define_label(&vtable_label(&name), seg);
            for qualified in &entry.vtable_blueprint {
                if qualified.is_empty() {
                    stream.add_data64(0, seg);
                } else {
                    stream.add_data64_reloc(qualified, seg);
                }
            }
        }
    }

    /// Emit the writable data section: the anchor label, then one word per
    /// global in registration order.
    pub fn generate_data_section(&self, stream: &mut InstructionStream) {
        let seg = Segment::Data;
        stream.define_label(DATA_SEGMENT_BASE_LABEL, seg);
        for (name, initial) in &self.globals {
            trace!(
                "global {name} at word {}",
                self.global_word_offsets[name]
            );
            stream.add_data64(*initial as u64, seg);
        }
    }
}

/// The rodata label of a class's vtable.
pub fn vtable_label(class_name: &str) -> String {
    format!("{class_name}_vtable")
}

/// Two 32-bit lanes packed into one word, first value in the low half.
pub fn pack_pair(first: i64, second: i64) -> u64 {
    ((first as u64) & 0xffff_ffff) | (((second as u64) & 0xffff_ffff) << 32)
}

/// Deterministic serialization of a list literal, used as the interning key.
fn canonical_list_key(items: &[Expr], manifests: &FxHashMap<String, i64>) -> String {
    let mut parts = Vec::with_capacity(items.len());
    for item in items {
        parts.push(match item {
            Expr::Float(f) => format!("float({f})"),
            Expr::StringLit(s) => format!("string({s})"),
            Expr::List { items, .. } => canonical_list_key(items, manifests),
            Expr::Pair { first, second } => format!(
                "pair({},{})",
                evaluate_constant_expression(first, manifests).unwrap_or(0),
                evaluate_constant_expression(second, manifests).unwrap_or(0)
            ),
            other => format!(
                "int({})",
                evaluate_constant_expression(other, manifests).unwrap_or(0)
            ),
        });
    }
    format!("list[{}]", parts.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::EntryKind;

    #[test]
    fn string_interning_shares_labels() {
        let mut data = DataGenerator::new();
        let a = data.add_string_literal("hello");
        let b = data.add_string_literal("hello");
        let c = data.add_string_literal("other");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn strings_emit_utf32_with_length_and_padding() {
        let mut data = DataGenerator::new();
        let label = data.add_string_literal("hi!");
        let mut stream = InstructionStream::new();
        data.generate_rodata_section(&mut stream, &ClassTable::new());
        let entries: Vec<_> = stream.entries_in(Segment::RoData).collect();
        // label, length, three code points, one pad word
        assert!(entries[0].label_def.as_deref() == Some(label.as_str()));
        assert_eq!(entries[1].kind, EntryKind::Data64 { value: 3 });
        assert_eq!(entries[2].kind, EntryKind::Data32 { value: 'h' as u32 });
        assert_eq!(entries[3].kind, EntryKind::Data32 { value: 'i' as u32 });
        assert_eq!(entries[4].kind, EntryKind::Data32 { value: '!' as u32 });
        assert_eq!(entries[5].kind, EntryKind::Data32 { value: 0 });
    }

    #[test]
    fn pairs_pack_low_lane_first() {
        assert_eq!(pack_pair(1, 2), 0x0000_0002_0000_0001);
        assert_eq!(pack_pair(-1, 0), 0x0000_0000_ffff_ffff);
    }

    #[test]
    fn identical_list_literals_share_a_template() {
        let mut data = DataGenerator::new();
        let manifests = FxHashMap::default();
        let items = vec![Expr::number(1), Expr::StringLit("hi".into())];
        let a = data.add_list_literal(&items, &manifests);
        let b = data.add_list_literal(&items, &manifests);
        assert_eq!(a, b);
        let different = vec![Expr::number(2)];
        assert_ne!(a, data.add_list_literal(&different, &manifests));
    }

    #[test]
    fn list_nodes_chain_and_terminate() {
        let mut data = DataGenerator::new();
        let manifests = FxHashMap::default();
        let label = data.add_list_literal(&[Expr::number(7), Expr::number(8)], &manifests);
        let mut stream = InstructionStream::new();
        data.generate_rodata_section(&mut stream, &ClassTable::new());
        assert!(stream.label_is_defined(&label));
        assert!(stream.label_is_defined(&format!("{label}_node0")));
        assert!(stream.label_is_defined(&format!("{label}_node1")));
        // The final node's next pointer is a plain zero word.
        let texts: Vec<String> = stream.listing(Segment::RoData);
        assert!(texts.iter().any(|t| t == &format!(".quad {label}_node1")));
    }

    #[test]
    fn globals_follow_the_anchor_in_order() {
        let mut data = DataGenerator::new();
        data.add_global_variable("A", 5);
        data.add_global_variable("B", 0);
        data.add_global_variable("A", 9); // duplicate ignored
        assert_eq!(data.global_word_offset("A"), Some(0));
        assert_eq!(data.global_word_offset("B"), Some(1));
        let mut stream = InstructionStream::new();
        data.generate_data_section(&mut stream);
        let entries: Vec<_> = stream.entries_in(Segment::Data).collect();
        assert_eq!(
            entries[0].label_def.as_deref(),
            Some(DATA_SEGMENT_BASE_LABEL)
        );
        assert_eq!(entries[1].kind, EntryKind::Data64 { value: 5 });
        assert_eq!(entries[2].kind, EntryKind::Data64 { value: 0 });
    }

    #[test]
    fn vtables_emit_blueprint_order_with_zero_for_empty_slots() {
        let mut classes = ClassTable::new();
        classes.add_class("Point", "");
        {
            let entry = classes.get_class_mut("Point").unwrap();
            entry.vtable_blueprint = vec![
                "Point::CREATE".to_string(),
                String::new(),
                "Point::getX".to_string(),
            ];
            entry.is_layout_finalized = true;
        }
        let data = DataGenerator::new();
        let mut stream = InstructionStream::new();
        data.generate_rodata_section(&mut stream, &classes);
        assert!(stream.label_is_defined("Point_vtable"));
        let texts = stream.listing_after_label("Point_vtable");
        assert_eq!(texts[0], ".quad Point::CREATE");
        assert_eq!(texts[1], ".quad 0x0");
        assert_eq!(texts[2], ".quad Point::getX");
    }
}
