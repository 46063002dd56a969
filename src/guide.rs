//! Feature guide: a declarative schema naming which columns serve as the
//! prediction target, row index, unique key, entity ids, categoricals, and
//! real-valued features.
//!
//! The on-disk format is line oriented: `#` lines are comments, and a section
//! line has the form `<letter>:<comma-separated names>;` with letter one of
//! t/i/k/e/c/r. A section may span several lines until one ends with `;`.

use crate::errors::{PrepError, PrepResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::info;

/// An insertion-ordered set of column names. Preserves a canonical order for
/// reproducible feature layout while giving O(1) membership checks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct OrderedSet {
    names: Vec<String>,
    members: HashSet<String>,
}

impl OrderedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert at the end; duplicates are ignored. Returns true if inserted.
    pub fn insert(&mut self, name: impl Into<String>) -> bool {
        let name = name.into();
        if self.members.contains(&name) {
            return false;
        }
        self.members.insert(name.clone());
        self.names.push(name);
        true
    }

    /// Remove a name, preserving the order of the rest. Returns true if it
    /// was present.
    pub fn remove(&mut self, name: &str) -> bool {
        if !self.members.remove(name) {
            return false;
        }
        self.names.retain(|n| n != name);
        true
    }

    pub fn contains(&self, name: &str) -> bool {
        self.members.contains(name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, String> {
        self.names.iter()
    }

    pub fn first(&self) -> Option<&String> {
        self.names.first()
    }

    pub fn last(&self) -> Option<&String> {
        self.names.last()
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.names.clone()
    }

    /// Union with `other`: names of `other` not already present are appended
    /// in their order.
    pub fn union_with(&mut self, other: &OrderedSet) {
        for name in other.iter() {
            self.insert(name.clone());
        }
    }

    /// Names present in `self` but not in `other`, in self's order.
    pub fn difference(&self, other: &OrderedSet) -> OrderedSet {
        let mut out = OrderedSet::new();
        for name in self.iter() {
            if !other.contains(name) {
                out.insert(name.clone());
            }
        }
        out
    }
}

impl From<Vec<String>> for OrderedSet {
    fn from(names: Vec<String>) -> Self {
        let mut set = OrderedSet::new();
        for name in names {
            set.insert(name);
        }
        set
    }
}

impl From<OrderedSet> for Vec<String> {
    fn from(set: OrderedSet) -> Self {
        set.names
    }
}

impl<'a> IntoIterator for &'a OrderedSet {
    type Item = &'a String;
    type IntoIter = std::slice::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.names.iter()
    }
}

impl FromIterator<String> for OrderedSet {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        let mut set = OrderedSet::new();
        for name in iter {
            set.insert(name);
        }
        set
    }
}

/// Section letters of the guide file, paired with their section names.
const SECTION_LETTERS: [(char, &str); 6] = [
    ('t', "target"),
    ('i', "index"),
    ('k', "key"),
    ('e', "entities"),
    ('c', "categoricals"),
    ('r', "real_valueds"),
];

/// Parsed and validated feature guide.
///
/// The target is singular by construction; every other section is an ordered
/// set. Feature sections (entities, categoricals, real_valueds) are disjoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureGuide {
    pub target: String,
    pub index: OrderedSet,
    pub key: OrderedSet,
    pub entities: OrderedSet,
    pub categoricals: OrderedSet,
    pub real_valueds: OrderedSet,
    #[serde(default)]
    pub comments: Vec<String>,
}

impl FeatureGuide {
    /// Parse a guide from its text form.
    pub fn parse(source: &str) -> PrepResult<Self> {
        // One regex recognizes a section-start line; continuation lines are
        // raw name lists belonging to the previously started section.
        let section_re = Regex::new(r"^([a-z])\s*:(.*)$").expect("static regex");

        let mut comments = Vec::new();
        let mut sections: Vec<(char, Vec<String>)> = SECTION_LETTERS
            .iter()
            .map(|(letter, _)| (*letter, Vec::new()))
            .collect();
        let mut open_section: Option<char> = None;

        for raw in source.lines() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            if line.starts_with('#') {
                comments.push(line.trim_start_matches('#').trim().to_string());
                continue;
            }

            let (letter, csv) = match open_section {
                Some(letter) => (letter, line),
                None => {
                    let caps = section_re.captures(line).ok_or_else(|| {
                        PrepError::Config(format!("unrecognized guide line: '{line}'"))
                    })?;
                    let letter = caps
                        .get(1)
                        .map(|m| m.as_str().chars().next().unwrap_or(' '))
                        .unwrap_or(' ');
                    if !SECTION_LETTERS.iter().any(|(l, _)| *l == letter) {
                        return Err(PrepError::Config(format!(
                            "unknown guide section letter '{letter}'"
                        )));
                    }
                    (letter, caps.get(2).map(|m| m.as_str()).unwrap_or(""))
                }
            };

            let terminated = csv.trim_end().ends_with(';');
            let csv = csv.trim_end().trim_end_matches(';');
            let names = sections
                .iter_mut()
                .find(|(l, _)| *l == letter)
                .map(|(_, v)| v)
                .expect("letter validated above");
            names.extend(
                csv.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from),
            );

            open_section = if terminated { None } else { Some(letter) };
        }

        if let Some(letter) = open_section {
            return Err(PrepError::Config(format!(
                "section '{letter}' is not terminated with ';'"
            )));
        }

        let take = |letter: char| -> OrderedSet {
            sections
                .iter()
                .find(|(l, _)| *l == letter)
                .map(|(_, v)| v.iter().cloned().collect())
                .unwrap_or_default()
        };

        let targets = take('t');
        if targets.len() != 1 {
            return Err(PrepError::Config(format!(
                "guide must declare exactly 1 target, got {}; check for the \
                 ';' at the end of the t:<target> line",
                targets.len()
            )));
        }
        let entities = take('e');
        if entities.is_empty() {
            return Err(PrepError::Config(
                "guide declares 0 entity columns; need at least 1".to_string(),
            ));
        }

        let guide = FeatureGuide {
            target: targets.first().cloned().unwrap_or_default(),
            index: take('i'),
            key: take('k'),
            entities,
            categoricals: take('c'),
            real_valueds: take('r'),
            comments,
        };
        guide.check_feature_disjointness()?;

        info!(
            target = %guide.target,
            entities = ?guide.entities.to_vec(),
            categoricals = ?guide.categoricals.to_vec(),
            real_valueds = ?guide.real_valueds.to_vec(),
            "parsed feature guide"
        );
        Ok(guide)
    }

    /// Read and parse a guide file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> PrepResult<Self> {
        let source = fs::read_to_string(path.as_ref())?;
        Self::parse(&source)
    }

    /// Build a guide directly from name lists, bypassing the text format.
    pub fn from_name_lists(
        target: &str,
        entities: &[&str],
        categoricals: &[&str],
        real_valueds: &[&str],
    ) -> PrepResult<Self> {
        if entities.is_empty() {
            return Err(PrepError::Config(
                "guide declares 0 entity columns; need at least 1".to_string(),
            ));
        }
        let guide = FeatureGuide {
            target: target.to_string(),
            index: OrderedSet::new(),
            key: OrderedSet::new(),
            entities: entities.iter().map(|s| s.to_string()).collect(),
            categoricals: categoricals.iter().map(|s| s.to_string()).collect(),
            real_valueds: real_valueds.iter().map(|s| s.to_string()).collect(),
            comments: Vec::new(),
        };
        guide.check_feature_disjointness()?;
        Ok(guide)
    }

    fn check_feature_disjointness(&self) -> PrepResult<()> {
        for name in self.entities.iter() {
            if self.categoricals.contains(name) || self.real_valueds.contains(name) {
                return Err(PrepError::Config(format!(
                    "'{name}' appears in more than one feature section"
                )));
            }
        }
        for name in self.categoricals.iter() {
            if self.real_valueds.contains(name) {
                return Err(PrepError::Config(format!(
                    "'{name}' appears in more than one feature section"
                )));
            }
        }
        Ok(())
    }

    /// All feature names: entities, then categoricals, then real-valueds.
    /// This traversal order is stable and determines encoded feature layout.
    pub fn feature_names(&self) -> OrderedSet {
        let mut names = self.entities.clone();
        names.union_with(&self.categoricals);
        names.union_with(&self.real_valueds);
        names
    }

    /// Every column the guide references: target, index, key, then features.
    pub fn all_names(&self) -> OrderedSet {
        let mut names = OrderedSet::new();
        names.insert(self.target.clone());
        names.union_with(&self.index);
        names.union_with(&self.key);
        names.union_with(&self.feature_names());
        names
    }

    /// Resolve the row-identifier columns:
    /// 1. the declared index, if any;
    /// 2. else the key, if none of its columns double as features;
    /// 3. else None (positional row order identifies rows).
    pub fn index_columns(&self) -> Option<Vec<String>> {
        if !self.index.is_empty() {
            return Some(self.index.to_vec());
        }
        if !self.key.is_empty() {
            let features = self.feature_names();
            if self.key.iter().all(|k| !features.contains(k)) {
                return Some(self.key.to_vec());
            }
        }
        None
    }

    /// Remove a name from every feature section where it appears.
    ///
    /// Fails with `Config` for the target, index, or key columns and with
    /// `NotFound` when the name is in no feature section.
    pub fn remove(&mut self, name: &str) -> PrepResult<()> {
        if name == self.target || self.index.contains(name) {
            return Err(PrepError::Config(format!(
                "cannot remove '{name}': target and index columns are not features"
            )));
        }
        if self.key.contains(name) {
            return Err(PrepError::Config(format!(
                "cannot remove '{name}': key columns are immutable"
            )));
        }

        let removed = [
            self.entities.remove(name),
            self.categoricals.remove(name),
            self.real_valueds.remove(name),
        ]
        .iter()
        .any(|r| *r);

        if !removed {
            return Err(PrepError::NotFound(name.to_string()));
        }
        Ok(())
    }

    /// Per-section union with another guide. Targets must agree.
    pub fn union(&mut self, other: &FeatureGuide) -> PrepResult<()> {
        if self.target != other.target {
            return Err(PrepError::Config(format!(
                "target mismatch ({} != {})",
                self.target, other.target
            )));
        }
        self.index.union_with(&other.index);
        self.key.union_with(&other.key);
        self.entities.union_with(&other.entities);
        self.categoricals.union_with(&other.categoricals);
        self.real_valueds.union_with(&other.real_valueds);
        self.check_feature_disjointness()
    }

    /// Union of all guides in the slice, returned as a new guide.
    pub fn union_all(guides: &[FeatureGuide]) -> PrepResult<FeatureGuide> {
        let first = guides
            .first()
            .ok_or_else(|| PrepError::Config("union_all over zero guides".to_string()))?;
        let mut merged = first.clone();
        for other in &guides[1..] {
            merged.union(other)?;
        }
        Ok(merged)
    }

    /// Write the guide back out in its text form.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> PrepResult<()> {
        fs::write(path.as_ref(), self.to_string())?;
        Ok(())
    }
}

impl fmt::Display for FeatureGuide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for comment in &self.comments {
            writeln!(f, "# {comment}")?;
        }
        let section = |set: &OrderedSet| set.to_vec().join(",");
        writeln!(f, "t:{};", self.target)?;
        writeln!(f, "i:{};", section(&self.index))?;
        writeln!(f, "k:{};", section(&self.key))?;
        writeln!(f, "e:{};", section(&self.entities))?;
        writeln!(f, "c:{};", section(&self.categoricals))?;
        write!(f, "r:{};", section(&self.real_valueds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GUIDE: &str = "\
# grades dataset
t:grade;
i:;
k:student,course,term;
e:student,course;
c:major;
r:gpa,age;
";

    #[test]
    fn test_ordered_set_preserves_insertion_order() {
        let mut set = OrderedSet::new();
        set.insert("b");
        set.insert("a");
        set.insert("b");
        assert_eq!(set.to_vec(), vec!["b", "a"]);
        assert!(set.contains("a"));
        assert!(!set.contains("c"));
    }

    #[test]
    fn test_ordered_set_union_and_difference() {
        let left: OrderedSet = vec!["a".to_string(), "b".to_string()].into();
        let right: OrderedSet = vec!["c".to_string(), "b".to_string()].into();

        let mut merged = left.clone();
        merged.union_with(&right);
        assert_eq!(merged.to_vec(), vec!["a", "b", "c"]);

        assert_eq!(left.difference(&right).to_vec(), vec!["a"]);
    }

    #[test]
    fn test_parse_sections() {
        let guide = FeatureGuide::parse(GUIDE).unwrap();
        assert_eq!(guide.target, "grade");
        assert_eq!(guide.key.to_vec(), vec!["student", "course", "term"]);
        assert_eq!(guide.entities.to_vec(), vec!["student", "course"]);
        assert_eq!(guide.categoricals.to_vec(), vec!["major"]);
        assert_eq!(guide.real_valueds.to_vec(), vec!["gpa", "age"]);
        assert_eq!(guide.comments, vec!["grades dataset"]);
    }

    #[test]
    fn test_parse_multiline_section() {
        let source = "t:grade;\ne:student,\ncourse;\nr:gpa;";
        let guide = FeatureGuide::parse(source).unwrap();
        assert_eq!(guide.entities.to_vec(), vec!["student", "course"]);
    }

    #[test]
    fn test_parse_discards_empty_names() {
        let source = "t:grade;\ne:student, ,course;\n";
        let guide = FeatureGuide::parse(source).unwrap();
        assert_eq!(guide.entities.to_vec(), vec!["student", "course"]);
    }

    #[test]
    fn test_parse_rejects_multiple_targets() {
        let err = FeatureGuide::parse("t:grade,score;\ne:student;").unwrap_err();
        assert!(matches!(err, PrepError::Config(_)));
    }

    #[test]
    fn test_parse_rejects_zero_entities() {
        let err = FeatureGuide::parse("t:grade;\ne:;").unwrap_err();
        assert!(matches!(err, PrepError::Config(_)));
    }

    #[test]
    fn test_parse_rejects_unterminated_section() {
        let err = FeatureGuide::parse("t:grade;\ne:student,course").unwrap_err();
        assert!(matches!(err, PrepError::Config(_)));
    }

    #[test]
    fn test_parse_rejects_overlapping_feature_sections() {
        let err = FeatureGuide::parse("t:grade;\ne:student;\nr:student;").unwrap_err();
        assert!(matches!(err, PrepError::Config(_)));
    }

    #[test]
    fn test_remove_feature() {
        let mut guide = FeatureGuide::parse(GUIDE).unwrap();
        guide.remove("gpa").unwrap();
        assert!(!guide.real_valueds.contains("gpa"));
    }

    #[test]
    fn test_remove_rejects_key_and_target() {
        let mut guide = FeatureGuide::parse(GUIDE).unwrap();
        assert!(matches!(guide.remove("term"), Err(PrepError::Config(_))));
        assert!(matches!(guide.remove("grade"), Err(PrepError::Config(_))));
        assert!(matches!(
            guide.remove("nonexistent"),
            Err(PrepError::NotFound(_))
        ));
    }

    #[test]
    fn test_remove_entity_is_allowed_even_when_in_key() {
        // student is both an entity and part of the key: key wins.
        let mut guide = FeatureGuide::parse(GUIDE).unwrap();
        assert!(matches!(guide.remove("student"), Err(PrepError::Config(_))));
    }

    #[test]
    fn test_union_merges_sections() {
        let mut left = FeatureGuide::parse("t:grade;\ne:student;\nr:gpa;").unwrap();
        let right = FeatureGuide::parse("t:grade;\ne:course;\nr:age;").unwrap();
        left.union(&right).unwrap();
        assert_eq!(left.entities.to_vec(), vec!["student", "course"]);
        assert_eq!(left.real_valueds.to_vec(), vec!["gpa", "age"]);
    }

    #[test]
    fn test_union_rejects_target_mismatch() {
        let mut left = FeatureGuide::parse("t:grade;\ne:student;").unwrap();
        let right = FeatureGuide::parse("t:score;\ne:student;").unwrap();
        assert!(matches!(left.union(&right), Err(PrepError::Config(_))));
    }

    #[test]
    fn test_union_all() {
        let guides = vec![
            FeatureGuide::parse("t:grade;\ne:student;").unwrap(),
            FeatureGuide::parse("t:grade;\ne:course;\nc:major;").unwrap(),
        ];
        let merged = FeatureGuide::union_all(&guides).unwrap();
        assert_eq!(merged.entities.to_vec(), vec!["student", "course"]);
        assert_eq!(merged.categoricals.to_vec(), vec!["major"]);
    }

    #[test]
    fn test_index_resolution_prefers_index_then_key() {
        let guide = FeatureGuide::parse("t:grade;\ni:row_id;\ne:student;").unwrap();
        assert_eq!(guide.index_columns(), Some(vec!["row_id".to_string()]));

        // Key columns overlap features -> positional index.
        let guide = FeatureGuide::parse(GUIDE).unwrap();
        assert_eq!(guide.index_columns(), None);

        // Disjoint key -> key is the index.
        let guide = FeatureGuide::parse("t:grade;\nk:row_id;\ne:student;").unwrap();
        assert_eq!(guide.index_columns(), Some(vec!["row_id".to_string()]));
    }

    #[test]
    fn test_display_round_trip() {
        let guide = FeatureGuide::parse(GUIDE).unwrap();
        let reparsed = FeatureGuide::parse(&guide.to_string()).unwrap();
        assert_eq!(guide, reparsed);
    }

    #[test]
    fn test_feature_name_order_is_stable() {
        let guide = FeatureGuide::parse(GUIDE).unwrap();
        assert_eq!(
            guide.feature_names().to_vec(),
            vec!["student", "course", "major", "gpa", "age"]
        );
    }
}
