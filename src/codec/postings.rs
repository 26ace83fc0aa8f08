//! Posting lists.
//!
//! Postings map `(field, term)` to the sorted list of segment ordinals that
//! contain the term, with per-document frequency and positions.

use std::collections::BTreeMap;

use ahash::AHashMap;

/// A single posting in a posting list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Posting {
    /// Segment-local document ordinal.
    pub doc: u32,
    /// Term frequency in the document.
    pub frequency: u32,
    /// Positions of the term in the document, ascending.
    pub positions: Vec<u32>,
}

impl Posting {
    /// Create a posting with positions; the frequency is their count.
    pub fn with_positions(doc: u32, positions: Vec<u32>) -> Self {
        Posting {
            doc,
            frequency: positions.len() as u32,
            positions,
        }
    }

    /// Get the term frequency.
    pub fn frequency(&self) -> u32 {
        self.frequency
    }
}

/// A posting list for a specific term, sorted by doc ordinal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostingList {
    /// The postings in this list.
    pub postings: Vec<Posting>,
}

impl PostingList {
    /// Create a new empty posting list.
    pub fn new() -> Self {
        PostingList::default()
    }

    /// Append a posting. Ordinals must be strictly increasing.
    pub fn push(&mut self, posting: Posting) {
        debug_assert!(self.postings.last().is_none_or(|p| p.doc < posting.doc));
        self.postings.push(posting);
    }

    /// Record one occurrence of the term in `doc`.
    ///
    /// Documents arrive in ordinal order, so the occurrence either extends the
    /// last posting or starts a new one.
    pub fn add_occurrence(&mut self, doc: u32, position: u32) {
        match self.postings.last_mut() {
            Some(last) if last.doc == doc => {
                last.positions.push(position);
                last.frequency += 1;
            }
            _ => self.postings.push(Posting::with_positions(doc, vec![position])),
        }
    }

    /// Document frequency.
    pub fn doc_frequency(&self) -> usize {
        self.postings.len()
    }

    /// Total frequency across all documents.
    pub fn total_frequency(&self) -> u64 {
        self.postings.iter().map(|p| p.frequency as u64).sum()
    }

    /// Get the length of the posting list.
    pub fn len(&self) -> usize {
        self.postings.len()
    }

    /// Check if the posting list is empty.
    pub fn is_empty(&self) -> bool {
        self.postings.is_empty()
    }

    /// Get an iterator over the postings.
    pub fn iter(&self) -> std::slice::Iter<'_, Posting> {
        self.postings.iter()
    }

    /// Sorted doc ordinals.
    pub fn docs(&self) -> impl Iterator<Item = u32> + '_ {
        self.postings.iter().map(|p| p.doc)
    }
}

/// Term dictionary of one field, in term order.
pub type FieldPostings = BTreeMap<String, PostingList>;

/// All postings of a sealed segment, by field then term.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentPostings {
    fields: BTreeMap<String, FieldPostings>,
}

impl SegmentPostings {
    pub fn new() -> Self {
        SegmentPostings::default()
    }

    /// Insert the posting list of a term. Empty lists are ignored.
    pub fn insert(&mut self, field: &str, term: &str, list: PostingList) {
        if list.is_empty() {
            return;
        }
        self.fields
            .entry(field.to_string())
            .or_default()
            .insert(term.to_string(), list);
    }

    /// Posting list of a term, if any document contains it.
    pub fn get(&self, field: &str, term: &str) -> Option<&PostingList> {
        self.fields.get(field).and_then(|terms| terms.get(term))
    }

    /// Term dictionary of a field.
    pub fn field(&self, field: &str) -> Option<&FieldPostings> {
        self.fields.get(field)
    }

    /// Iterate fields in name order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldPostings)> {
        self.fields.iter().map(|(name, terms)| (name.as_str(), terms))
    }

    /// Number of distinct `(field, term)` pairs.
    pub fn term_count(&self) -> usize {
        self.fields.values().map(|terms| terms.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// In-memory inverted index used while buffering documents.
///
/// Terms are kept in hash maps for cheap appends and sorted once on
/// [`TermPostingIndex::seal`].
#[derive(Debug, Default)]
pub struct TermPostingIndex {
    fields: AHashMap<String, AHashMap<String, PostingList>>,
    occurrences: u64,
}

impl TermPostingIndex {
    /// Create a new empty term posting index.
    pub fn new() -> Self {
        TermPostingIndex::default()
    }

    /// Record `term` at `position` of `field` in buffered document `doc`.
    pub fn add_occurrence(&mut self, field: &str, term: &str, doc: u32, position: u32) {
        let terms = match self.fields.get_mut(field) {
            Some(terms) => terms,
            None => self.fields.entry(field.to_string()).or_default(),
        };
        match terms.get_mut(term) {
            Some(list) => list.add_occurrence(doc, position),
            None => {
                let mut list = PostingList::new();
                list.add_occurrence(doc, position);
                terms.insert(term.to_string(), list);
            }
        }
        self.occurrences += 1;
    }

    /// Buffered documents containing `term` in `field`.
    pub fn docs(&self, field: &str, term: &str) -> Vec<u32> {
        self.fields
            .get(field)
            .and_then(|terms| terms.get(term))
            .map(|list| list.docs().collect())
            .unwrap_or_default()
    }

    /// Number of recorded term occurrences.
    pub fn occurrences(&self) -> u64 {
        self.occurrences
    }

    /// Number of distinct terms across all fields.
    pub fn term_count(&self) -> usize {
        self.fields.values().map(|terms| terms.len()).sum()
    }

    /// Sort the dictionary into sealed segment postings.
    pub fn seal(self) -> SegmentPostings {
        let mut sealed = SegmentPostings::new();
        for (field, terms) in self.fields {
            let sorted: FieldPostings = terms.into_iter().collect();
            sealed.fields.insert(field, sorted);
        }
        sealed
    }
}
