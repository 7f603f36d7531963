//! Closed category -> subtype table used to validate model output.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

const MEDIEVAL: &[(&str, &[&str])] = &[
    (
        "Genre",
        &[
            "chronicle",
            "dialogue",
            "epic",
            "exemplum",
            "hagiography",
            "legal_text",
            "letter",
            "poetry",
            "romance",
            "sermon",
            "treatise",
        ],
    ),
    (
        "Rhetoric",
        &[
            "allegory",
            "amplificatio",
            "anaphora",
            "antithesis",
            "apostrophe",
            "formula",
            "hyperbole",
            "invocation",
            "metaphor",
            "rhetorical_question",
            "simile",
            "topos",
        ],
    ),
    (
        "Lexis",
        &[
            "arabism",
            "archaism",
            "authority",
            "catalanism",
            "courtly",
            "latinism",
            "legal",
            "military",
            "neologism",
            "onomastic",
            "religious",
        ],
    ),
    (
        "Verb_Functions",
        &[
            "declarative",
            "descriptive",
            "hypothetical",
            "imperative",
            "narrative",
            "performative",
            "periphrastic",
            "ritual",
        ],
    ),
    (
        "Notes",
        &[
            "ambiguity",
            "biblical_reference",
            "classical_reference",
            "historical_reference",
            "scribal_note",
            "textual_variant",
            "translation_note",
        ],
    ),
];

/// Read-only after construction; share it behind `Arc` across chunk tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Taxonomy {
    categories: BTreeMap<String, BTreeSet<String>>,
}

impl Taxonomy {
    /// The literary-linguistic table for medieval Iberian prose.
    pub fn medieval() -> Self {
        let categories = MEDIEVAL
            .iter()
            .map(|(category, subtypes)| {
                (
                    (*category).to_string(),
                    subtypes.iter().map(|s| (*s).to_string()).collect(),
                )
            })
            .collect();
        Self { categories }
    }

    pub fn from_map(categories: BTreeMap<String, BTreeSet<String>>) -> Self {
        Self { categories }
    }

    pub fn as_map(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.categories
    }

    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.categories.keys().map(String::as_str)
    }

    pub fn subtypes(&self, category: &str) -> Option<&BTreeSet<String>> {
        self.categories.get(category)
    }

    pub fn has_category(&self, category: &str) -> bool {
        self.categories.contains_key(category)
    }

    /// Exact, case-sensitive membership. No fuzzy matching.
    pub fn contains(&self, category: &str, subtype: &str) -> bool {
        self.categories
            .get(category)
            .is_some_and(|subtypes| subtypes.contains(subtype))
    }

    /// Renders the table as bullet lines for a model prompt.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for (category, subtypes) in &self.categories {
            let joined = subtypes.iter().map(String::as_str).collect::<Vec<_>>().join(", ");
            let _ = writeln!(out, "- {category}: {joined}");
        }
        out
    }
}

impl Default for Taxonomy {
    fn default() -> Self {
        Self::medieval()
    }
}
