//! Pixel format and modifier tables.
//!
//! A [`FormatSet`] maps a fourcc code to the layout modifiers a device
//! accepts for it. The sets are built once per capability query and then
//! only read; negotiation narrows them down by [intersection](FormatSet::intersect).

use indexmap::IndexMap;

use super::{Fourcc, Modifier};

/// An insertion-ordered set of pixel formats and the modifiers supported
/// for each.
///
/// A format that is present always carries at least one modifier; the
/// implicit [`Modifier::Invalid`] sentinel is an ordinary member, so a set
/// can state "this format, driver-chosen layout only".
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FormatSet {
    formats: IndexMap<Fourcc, Vec<Modifier>>,
}

impl FormatSet {
    /// Create an empty set.
    pub fn new() -> FormatSet {
        Default::default()
    }

    /// Record `modifier` as supported for `format`.
    ///
    /// Duplicate entries are ignored.
    pub fn add(&mut self, format: Fourcc, modifier: Modifier) {
        let modifiers = self.formats.entry(format).or_default();
        if !modifiers.contains(&modifier) {
            modifiers.push(modifier);
        }
    }

    /// Whether `format` is supported with exactly `modifier`.
    pub fn has(&self, format: Fourcc, modifier: Modifier) -> bool {
        self.formats
            .get(&format)
            .is_some_and(|modifiers| modifiers.contains(&modifier))
    }

    /// Whether `format` is present at all.
    pub fn contains(&self, format: Fourcc) -> bool {
        self.formats.contains_key(&format)
    }

    /// The modifiers accepted for `format`, if it is present.
    pub fn get(&self, format: Fourcc) -> Option<&[Modifier]> {
        self.formats.get(&format).map(|modifiers| modifiers.as_slice())
    }

    /// Number of formats in the set.
    pub fn len(&self) -> usize {
        self.formats.len()
    }

    /// Whether the set holds no formats.
    pub fn is_empty(&self) -> bool {
        self.formats.is_empty()
    }

    /// Iterate over the formats in insertion order.
    pub fn formats(&self) -> impl Iterator<Item = Fourcc> + '_ {
        self.formats.keys().copied()
    }

    /// Iterate over `(format, modifiers)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (Fourcc, &[Modifier])> + '_ {
        self.formats
            .iter()
            .map(|(format, modifiers)| (*format, modifiers.as_slice()))
    }

    /// Intersect two sets.
    ///
    /// Formats present in both inputs keep the modifiers common to both;
    /// the implicit modifier intersects like any other value, so two sets
    /// that only share it still produce a usable length-1 entry. A format
    /// whose modifier intersection comes up empty is dropped from the
    /// result entirely, it is never present with no modifiers.
    pub fn intersect(&self, other: &FormatSet) -> FormatSet {
        let mut result = FormatSet::new();
        for (format, modifiers) in self.iter() {
            let Some(other_modifiers) = other.get(format) else {
                continue;
            };
            for modifier in modifiers.iter().filter(|m| other_modifiers.contains(m)) {
                result.add(format, *modifier);
            }
        }
        result
    }
}

impl FromIterator<(Fourcc, Modifier)> for FormatSet {
    fn from_iter<T: IntoIterator<Item = (Fourcc, Modifier)>>(iter: T) -> FormatSet {
        let mut set = FormatSet::new();
        for (format, modifier) in iter {
            set.add(format, modifier);
        }
        set
    }
}
