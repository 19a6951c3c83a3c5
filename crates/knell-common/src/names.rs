// names.rs — interned name table
//
// Script numbers serialize negative values as names; the table maps those
// names to small stable ids. Id 0 is the empty name.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NameId(pub u32);

impl NameId {
    pub const NONE: NameId = NameId(0);
}

#[derive(Debug, Default)]
pub struct NameTable {
    names: Vec<String>,
    lookup: HashMap<String, u32>,
}

impl NameTable {
    pub fn new() -> Self {
        let mut table = NameTable {
            names: Vec::new(),
            lookup: HashMap::new(),
        };
        table.names.push(String::new());
        table.lookup.insert(String::new(), 0);
        table
    }

    /// Returns the id for `name`, interning it on first sight.
    pub fn find_or_add(&mut self, name: &str) -> NameId {
        if let Some(&id) = self.lookup.get(name) {
            return NameId(id);
        }
        let id = self.names.len() as u32;
        self.names.push(name.to_string());
        self.lookup.insert(name.to_string(), id);
        NameId(id)
    }

    pub fn find(&self, name: &str) -> Option<NameId> {
        self.lookup.get(name).map(|&id| NameId(id))
    }

    /// The string for an id; unknown ids read as the empty name.
    pub fn get(&self, id: NameId) -> &str {
        self.names.get(id.0 as usize).map_or("", |s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.len() <= 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_is_stable() {
        let mut names = NameTable::new();
        let a = names.find_or_add("OpenDoor");
        let b = names.find_or_add("CloseDoor");
        assert_ne!(a, b);
        assert_eq!(names.find_or_add("OpenDoor"), a);
        assert_eq!(names.get(a), "OpenDoor");
        assert_eq!(names.find("CloseDoor"), Some(b));
        assert_eq!(names.find("missing"), None);
    }

    #[test]
    fn id_zero_is_empty_name() {
        let names = NameTable::new();
        assert_eq!(names.get(NameId::NONE), "");
        assert!(names.is_empty());
    }
}
