//! Ordered media format lists
//!
//! Capability sets are carried as ordered lists: position is preference.
//! The list never holds two formats with the same name. Mask entries and
//! preference orders may use `*` wildcards at either end of a name.

use super::MediaFormat;

/// Match a format name against a pattern with optional `*` at the ends
pub fn wildcard_match(name: &str, pattern: &str) -> bool {
    match (pattern.strip_prefix('*'), pattern.strip_suffix('*')) {
        (Some(_), Some(_)) => {
            let middle = &pattern[1..pattern.len() - 1];
            middle.is_empty() || name.contains(middle)
        }
        (Some(suffix), None) => name.ends_with(suffix),
        (None, Some(prefix)) => name.starts_with(prefix),
        (None, None) => name.eq_ignore_ascii_case(pattern),
    }
}

/// Duplicate-free, preference-ordered list of formats
#[derive(Debug, Clone, Default)]
pub struct OrderedFormatList {
    formats: Vec<MediaFormat>,
}

impl OrderedFormatList {
    /// Empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// List from formats, dropping duplicate names
    pub fn from_formats(formats: impl IntoIterator<Item = MediaFormat>) -> Self {
        let mut list = Self::new();
        for format in formats {
            list.add(format);
        }
        list
    }

    /// Append unless a format of the same name is already present
    pub fn add(&mut self, format: MediaFormat) -> bool {
        if self.contains(format.name()) {
            return false;
        }
        self.formats.push(format);
        true
    }

    /// True when a format with this name is in the list
    pub fn contains(&self, name: &str) -> bool {
        self.formats.iter().any(|f| f.name() == name)
    }

    /// Find by name
    pub fn find(&self, name: &str) -> Option<&MediaFormat> {
        self.formats.iter().find(|f| f.name() == name)
    }

    /// Remove every format matching any of the mask patterns
    pub fn remove_masked(&mut self, mask: &[String]) {
        self.formats
            .retain(|f| !mask.iter().any(|pattern| wildcard_match(f.name(), pattern)));
    }

    /// Reorder so formats matching earlier preference patterns come first.
    /// Formats matching nothing keep their relative order at the end.
    pub fn reorder(&mut self, preference: &[String]) {
        let rank = |format: &MediaFormat| {
            preference
                .iter()
                .position(|pattern| wildcard_match(format.name(), pattern))
                .unwrap_or(preference.len())
        };
        self.formats.sort_by_key(rank);
    }

    /// Keep only formats whose name also appears in `other`
    pub fn intersect(&mut self, other: &OrderedFormatList) {
        self.formats.retain(|f| other.contains(f.name()));
    }

    /// First format in preference order
    pub fn first(&self) -> Option<&MediaFormat> {
        self.formats.first()
    }

    /// Number of formats
    pub fn len(&self) -> usize {
        self.formats.len()
    }

    /// True when no formats remain
    pub fn is_empty(&self) -> bool {
        self.formats.is_empty()
    }

    /// Iterate in preference order
    pub fn iter(&self) -> impl Iterator<Item = &MediaFormat> {
        self.formats.iter()
    }
}

impl IntoIterator for OrderedFormatList {
    type Item = MediaFormat;
    type IntoIter = std::vec::IntoIter<MediaFormat>;

    fn into_iter(self) -> Self::IntoIter {
        self.formats.into_iter()
    }
}

impl FromIterator<MediaFormat> for OrderedFormatList {
    fn from_iter<T: IntoIterator<Item = MediaFormat>>(iter: T) -> Self {
        Self::from_formats(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::registry::standard_formats;
    use crate::format::names;

    fn full_list() -> OrderedFormatList {
        OrderedFormatList::from_formats(standard_formats())
    }

    #[test]
    fn test_no_duplicates() {
        let mut list = full_list();
        let before = list.len();
        let dup = list.find(names::PCMU).unwrap().clone();
        assert!(!list.add(dup));
        assert_eq!(list.len(), before);
    }

    #[test]
    fn test_mask_removal() {
        let mut list = full_list();
        list.remove_masked(&[names::ILBC.to_string()]);
        assert!(!list.contains(names::ILBC));
        assert!(list.contains(names::PCMU));
    }

    #[test]
    fn test_mask_wildcard() {
        let mut list = full_list();
        list.remove_masked(&["G.711*".to_string()]);
        assert!(!list.contains(names::PCMU));
        assert!(!list.contains(names::PCMA));
        assert!(list.contains(names::G729));
    }

    #[test]
    fn test_reorder_preference() {
        let mut list = full_list();
        list.reorder(&[names::G722.to_string(), names::PCMU.to_string()]);
        assert_eq!(list.iter().next().unwrap().name(), names::G722);
        assert_eq!(list.iter().nth(1).unwrap().name(), names::PCMU);
    }

    #[test]
    fn test_intersection() {
        let mut mine = full_list();
        let theirs = OrderedFormatList::from_formats(
            standard_formats()
                .into_iter()
                .filter(|f| f.name() == names::PCMU || f.name() == names::G729),
        );
        mine.intersect(&theirs);
        assert_eq!(mine.len(), 2);
        assert!(mine.contains(names::PCMU));
        assert!(mine.contains(names::G729));
    }

    #[test]
    fn test_wildcard_match_forms() {
        assert!(wildcard_match("G.711-uLaw-64k", "G.711*"));
        assert!(wildcard_match("G.711-uLaw-64k", "*64k"));
        assert!(wildcard_match("G.711-uLaw-64k", "*uLaw*"));
        assert!(wildcard_match("G.729", "g.729"));
        assert!(!wildcard_match("G.729", "G.711*"));
    }
}
