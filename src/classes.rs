//! The class table: per-class member layout, method slots and inheritance
//! links.
//!
//! Word 0 of every object instance holds the vtable pointer, so member
//! offsets always start at 8. Slot 0 of every vtable is reserved for `CREATE`
//! and slot 1 for `RELEASE`; both may be empty until the class pass
//! synthesizes defaults. Overriding methods keep the parent's slot index,
//! which is what makes virtual dispatch through a base-class reference land
//! on the derived implementation.

use crate::ast::Visibility;
use crate::fx::FxHashMap;
use crate::types::VarType;

/// Mangle a method name with its class: `Point::getX`. Names that already
/// carry a qualifier are returned unchanged.
pub fn mangle_method(class_name: &str, method_name: &str) -> String {
    if is_qualified_name(method_name) {
        return method_name.to_string();
    }
    format!("{class_name}::{method_name}")
}

pub fn is_qualified_name(name: &str) -> bool {
    name.contains("::")
}

/// The class part of a qualified name, if any.
pub fn class_of_qualified_name(name: &str) -> Option<&str> {
    name.split_once("::").map(|(class, _)| class)
}

/// The method part of a qualified name, or the name itself.
pub fn simple_method_name(name: &str) -> &str {
    name.split_once("::").map_or(name, |(_, method)| method)
}

/// A member variable within a class.
#[derive(Clone, Debug, PartialEq)]
pub struct ClassMemberInfo {
    pub name: String,
    pub ty: VarType,
    /// Byte offset from the start of the object instance; always >= 8.
    pub offset: u64,
    pub visibility: Visibility,
}

/// A method within a class.
#[derive(Clone, Debug, PartialEq)]
pub struct ClassMethodInfo {
    pub name: String,
    /// `ClassName::methodName`.
    pub qualified_name: String,
    pub vtable_slot: usize,
    pub return_type: VarType,
    pub is_virtual: bool,
    pub is_final: bool,
    pub visibility: Visibility,
    pub parameters: Vec<VarType>,
}

/// A single entry in the class table.
#[derive(Clone, Debug, Default)]
pub struct ClassTableEntry {
    pub name: String,
    /// Empty when the class has no explicit parent.
    pub parent_name: String,
    pub member_variables: FxHashMap<String, ClassMemberInfo>,
    /// Qualified name -> method info.
    pub member_methods: FxHashMap<String, ClassMethodInfo>,
    /// Simple name -> qualified name, for unqualified lookups.
    pub simple_name_to_method: FxHashMap<String, String>,
    /// Ordered qualified names; empty string marks a reserved-but-unfilled
    /// slot. Index is the vtable slot.
    pub vtable_blueprint: Vec<String>,
    /// Total byte size of an instance, vtable word included.
    pub instance_size: u64,
    pub is_layout_finalized: bool,
}

impl ClassTableEntry {
    fn new(name: &str, parent_name: &str) -> Self {
        Self {
            name: name.to_string(),
            parent_name: parent_name.to_string(),
            ..Self::default()
        }
    }

    /// Register a member variable, clamping the offset past the vtable word.
    pub fn add_member_variable(&mut self, mut info: ClassMemberInfo) {
        if info.offset < 8 {
            info.offset = 8;
        }
        let member_end = info.offset + 8;
        if member_end > self.instance_size {
            self.instance_size = member_end;
        }
        self.member_variables.insert(info.name.clone(), info);
    }

    /// Register a method under both its qualified and simple names.
    pub fn add_member_method(&mut self, info: ClassMethodInfo) {
        self.simple_name_to_method
            .insert(info.name.clone(), info.qualified_name.clone());
        self.member_methods.insert(info.qualified_name.clone(), info);
    }

    /// Method lookup local to this entry: simple name first, then qualified.
    pub fn local_method(&self, method_name: &str) -> Option<&ClassMethodInfo> {
        if let Some(qualified) = self.simple_name_to_method.get(method_name) {
            return self.member_methods.get(qualified);
        }
        self.member_methods.get(method_name)
    }
}

/// The class table itself.
#[derive(Debug, Default)]
pub struct ClassTable {
    entries: FxHashMap<String, ClassTableEntry>,
}

impl ClassTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_class(&mut self, name: &str, parent_name: &str) {
        let mut entry = ClassTableEntry::new(name, parent_name);
        if !parent_name.is_empty() {
            if let Some(parent) = self.entries.get(parent_name) {
                if parent.is_layout_finalized {
                    entry.instance_size = parent.instance_size;
                }
            }
        }
        self.entries.insert(name.to_string(), entry);
    }

    pub fn class_exists(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn get_class(&self, name: &str) -> Option<&ClassTableEntry> {
        self.entries.get(name)
    }

    pub fn get_class_mut(&mut self, name: &str) -> Option<&mut ClassTableEntry> {
        self.entries.get_mut(name)
    }

    /// Find a method by simple or qualified name, walking the inheritance
    /// chain from `class_name` upward.
    pub fn find_method(&self, class_name: &str, method_name: &str) -> Option<&ClassMethodInfo> {
        let mut current = self.entries.get(class_name);
        while let Some(entry) = current {
            if let Some(info) = entry.local_method(method_name) {
                return Some(info);
            }
            // Inherited methods may have been copied under their original
            // qualified names; accept a suffix match before climbing.
            let suffix = format!("::{method_name}");
            if let Some(info) = entry
                .member_methods
                .values()
                .find(|m| m.qualified_name.ends_with(&suffix))
            {
                return Some(info);
            }
            current = if entry.parent_name.is_empty() {
                None
            } else {
                self.entries.get(&entry.parent_name)
            };
        }
        None
    }

    /// True when `descendant` is `ancestor` or inherits from it.
    pub fn is_descendant_of(&self, descendant: &str, ancestor: &str) -> bool {
        if descendant == ancestor {
            return true;
        }
        let mut current = self
            .entries
            .get(descendant)
            .map(|e| e.parent_name.as_str())
            .unwrap_or("");
        while !current.is_empty() {
            if current == ancestor {
                return true;
            }
            current = self
                .entries
                .get(current)
                .map(|e| e.parent_name.as_str())
                .unwrap_or("");
        }
        false
    }

    /// Whether a member of `class_name` with `visibility` may be accessed
    /// from code in `from_class` (which may be empty for free functions).
    pub fn member_accessible(
        &self,
        class_name: &str,
        visibility: Visibility,
        from_class: Option<&str>,
    ) -> bool {
        match visibility {
            Visibility::Public => true,
            Visibility::Private => from_class == Some(class_name),
            Visibility::Protected => match from_class {
                Some(from) => self.is_descendant_of(from, class_name),
                None => false,
            },
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &ClassTableEntry> {
        self.entries.values()
    }

    /// Class names in deterministic (sorted) order, for stable emission.
    pub fn class_names_sorted(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn method(class: &str, name: &str, slot: usize) -> ClassMethodInfo {
        ClassMethodInfo {
            name: name.to_string(),
            qualified_name: mangle_method(class, name),
            vtable_slot: slot,
            return_type: VarType::INTEGER,
            is_virtual: false,
            is_final: false,
            visibility: Visibility::Public,
            parameters: Vec::new(),
        }
    }

    #[test]
    fn mangling() {
        assert_eq!(mangle_method("Point", "getX"), "Point::getX");
        assert_eq!(mangle_method("Point", "Point::getX"), "Point::getX");
        assert_eq!(simple_method_name("Point::getX"), "getX");
        assert_eq!(class_of_qualified_name("Point::getX"), Some("Point"));
    }

    #[test]
    fn member_offsets_stay_clear_of_vtable() {
        let mut table = ClassTable::new();
        table.add_class("Point", "");
        let entry = table.get_class_mut("Point").unwrap();
        entry.add_member_variable(ClassMemberInfo {
            name: "x".into(),
            ty: VarType::INTEGER,
            offset: 0,
            visibility: Visibility::Public,
        });
        let info = &table.get_class("Point").unwrap().member_variables["x"];
        assert_eq!(info.offset, 8);
        assert_eq!(table.get_class("Point").unwrap().instance_size, 16);
    }

    #[test]
    fn method_lookup_walks_inheritance() {
        let mut table = ClassTable::new();
        table.add_class("A", "");
        table.add_class("B", "A");
        table
            .get_class_mut("A")
            .unwrap()
            .add_member_method(method("A", "area", 2));
        let found = table.find_method("B", "area").unwrap();
        assert_eq!(found.qualified_name, "A::area");
        assert!(table.is_descendant_of("B", "A"));
        assert!(!table.is_descendant_of("A", "B"));
    }

    #[test]
    fn visibility_rules() {
        let mut table = ClassTable::new();
        table.add_class("A", "");
        table.add_class("B", "A");
        assert!(table.member_accessible("A", Visibility::Public, None));
        assert!(!table.member_accessible("A", Visibility::Private, Some("B")));
        assert!(table.member_accessible("A", Visibility::Private, Some("A")));
        assert!(table.member_accessible("A", Visibility::Protected, Some("B")));
        assert!(!table.member_accessible("A", Visibility::Protected, None));
    }
}
