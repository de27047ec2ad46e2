//! Deduplication (C7)
//!
//! Two-stage grouping: exact match on `source_id`, then similarity over a
//! weighted composite (title, price, supplier, moq). Each group elects a
//! master; the other members receive a `canonical_of` back-pointer which is
//! written through the versioner. The deduper never deletes records.
//!
//! Text similarity is character-level normalized Levenshtein over
//! preprocessed text, which behaves reasonably on unsegmented CJK titles.
//! The metric sits behind `TextSimilarity` so a corpus-justified tokenizer
//! swap stays local.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::domain::entities::Product;
use crate::domain::version::checksum_hex;

/// Composite weights; see `DedupConfig::default` for the standard split
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DedupWeights {
    pub title: f64,
    pub price_min: f64,
    pub supplier: f64,
    pub moq: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Similarity threshold tau; records with composite >= tau group together
    pub threshold: f64,
    pub weights: DedupWeights,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            threshold: 0.85,
            weights: DedupWeights {
                title: 0.4,
                price_min: 0.3,
                supplier: 0.2,
                moq: 0.1,
            },
        }
    }
}

/// One dedup group with its elected master
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateGroup {
    /// Stable id derived from the sorted member set
    pub group_id: String,
    /// Member source_ids, sorted
    pub members: Vec<String>,
    pub master: String,
    pub mean_similarity: f64,
}

impl DuplicateGroup {
    /// Members that are not the master, i.e. receive `canonical_of`
    pub fn duplicates(&self) -> impl Iterator<Item = &String> {
        self.members.iter().filter(move |m| **m != self.master)
    }
}

/// Aggregate dedup statistics for the quality report
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DedupStats {
    pub total_records: usize,
    pub group_count: usize,
    pub duplicate_records: usize,
    pub duplicate_ratio: f64,
    pub mean_similarity: f64,
}

/// Character-level text similarity used by the composite
#[derive(Debug, Clone, Default)]
pub struct TextSimilarity;

impl TextSimilarity {
    /// Normalized similarity in [0, 1]
    pub fn score(&self, a: &str, b: &str) -> f64 {
        let a = preprocess(a);
        let b = preprocess(b);
        if a.is_empty() && b.is_empty() {
            return 1.0;
        }
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }
        if a == b {
            return 1.0;
        }
        let a_chars: Vec<char> = a.chars().collect();
        let b_chars: Vec<char> = b.chars().collect();
        let max_len = a_chars.len().max(b_chars.len()) as f64;
        1.0 - (levenshtein_distance(&a_chars, &b_chars) as f64 / max_len)
    }
}

/// Lowercase, strip everything but letters/digits/CJK, drop whitespace.
/// Unsegmented CJK titles compare character by character, so spacing
/// variants ("红苹果 500g" vs "红苹果500g") normalize identically.
fn preprocess(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect()
}

fn levenshtein_distance(a: &[char], b: &[char]) -> usize {
    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];

    for (i, a_char) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, b_char) in b.iter().enumerate() {
            let cost = usize::from(a_char != b_char);
            current[j + 1] = (previous[j + 1] + 1)
                .min(current[j] + 1)
                .min(previous[j] + cost);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}

/// The deduper (C7)
#[derive(Debug, Clone, Default)]
pub struct Deduper {
    config: DedupConfig,
    text: TextSimilarity,
}

impl Deduper {
    pub fn new(config: DedupConfig) -> Self {
        Self {
            config,
            text: TextSimilarity,
        }
    }

    /// Composite similarity of two products. Fields missing on either side
    /// drop out of the weighting; a supplier mismatch is neutral (two
    /// suppliers listing the same product is the cross-supplier dedup
    /// case), a supplier match confirms.
    pub fn similarity(&self, a: &Product, b: &Product) -> f64 {
        let weights = &self.config.weights;
        let mut score = 0.0;
        let mut weight_sum = 0.0;

        if !a.title.is_empty() && !b.title.is_empty() {
            score += weights.title * self.text.score(&a.title, &b.title);
            weight_sum += weights.title;
        }

        if let (Some(price_a), Some(price_b)) = (a.price_min, b.price_min) {
            let closeness = if price_a == price_b {
                1.0
            } else {
                1.0 - ((price_a - price_b).abs() / price_a.max(price_b)).min(1.0)
            };
            score += weights.price_min * closeness;
            weight_sum += weights.price_min;
        }

        if let (Some(supplier_a), Some(supplier_b)) = (&a.supplier_source_id, &b.supplier_source_id) {
            if supplier_a == supplier_b {
                score += weights.supplier;
                weight_sum += weights.supplier;
            }
        }

        if let (Some(moq_a), Some(moq_b)) = (a.moq, b.moq) {
            if moq_a == moq_b {
                score += weights.moq;
            }
            weight_sum += weights.moq;
        }

        if weight_sum == 0.0 {
            0.0
        } else {
            score / weight_sum
        }
    }

    /// Group the given products. `verified_suppliers` feeds master
    /// election. Deterministic: same input yields identical groupings and
    /// masters.
    pub fn group_products(&self, products: &[Product], verified_suppliers: &HashSet<String>) -> Vec<DuplicateGroup> {
        // Stage 1: exact source_id collapse, and a stable working order
        let mut by_id: HashMap<&str, &Product> = HashMap::new();
        for product in products {
            by_id.entry(product.source_id.as_str()).or_insert(product);
        }
        let mut distinct: Vec<&Product> = by_id.into_values().collect();
        distinct.sort_by(|a, b| a.source_id.cmp(&b.source_id));

        // Stage 2: greedy similarity grouping over the stable order
        let mut grouped: HashSet<usize> = HashSet::new();
        let mut groups = Vec::new();

        for i in 0..distinct.len() {
            if grouped.contains(&i) {
                continue;
            }
            let mut member_indices = vec![i];
            let mut similarity_sum = 0.0;

            for j in (i + 1)..distinct.len() {
                if grouped.contains(&j) {
                    continue;
                }
                let similarity = self.similarity(distinct[i], distinct[j]);
                if similarity >= self.config.threshold {
                    member_indices.push(j);
                    similarity_sum += similarity;
                    grouped.insert(j);
                }
            }

            if member_indices.len() < 2 {
                continue;
            }
            grouped.insert(i);

            let members: Vec<&Product> = member_indices.iter().map(|&index| distinct[index]).collect();
            let master = self.elect_master(&members, verified_suppliers);
            let mut member_ids: Vec<String> = members.iter().map(|p| p.source_id.clone()).collect();
            member_ids.sort();

            let mean_similarity = similarity_sum / (member_indices.len() - 1) as f64;
            groups.push(DuplicateGroup {
                group_id: checksum_hex(member_ids.join("|").as_bytes())[..16].to_string(),
                members: member_ids,
                master,
                mean_similarity,
            });
        }

        info!(
            "Dedup pass over {} records produced {} groups",
            products.len(),
            groups.len()
        );
        groups
    }

    /// Master preference: verified supplier, then higher sales_count, then
    /// earlier created_at; ties break by lexicographic source_id.
    fn elect_master(&self, members: &[&Product], verified_suppliers: &HashSet<String>) -> String {
        let mut best: Option<&Product> = None;
        for candidate in members {
            best = Some(match best {
                None => candidate,
                Some(current) => {
                    let candidate_verified = candidate
                        .supplier_source_id
                        .as_deref()
                        .map_or(false, |s| verified_suppliers.contains(s));
                    let current_verified = current
                        .supplier_source_id
                        .as_deref()
                        .map_or(false, |s| verified_suppliers.contains(s));

                    let ordering = candidate_verified
                        .cmp(&current_verified)
                        .then(candidate.sales_count.cmp(&current.sales_count))
                        .then(current.created_at.cmp(&candidate.created_at))
                        .then(current.source_id.cmp(&candidate.source_id));

                    if ordering == std::cmp::Ordering::Greater {
                        candidate
                    } else {
                        current
                    }
                }
            });
        }
        let master = best.map(|p| p.source_id.clone()).unwrap_or_default();
        debug!("Elected master {master} among {} members", members.len());
        master
    }

    /// Aggregate statistics over a grouping result
    pub fn stats(&self, total_records: usize, groups: &[DuplicateGroup]) -> DedupStats {
        let duplicate_records: usize = groups.iter().map(|g| g.members.len() - 1).sum();
        let mean_similarity = if groups.is_empty() {
            0.0
        } else {
            groups.iter().map(|g| g.mean_similarity).sum::<f64>() / groups.len() as f64
        };
        DedupStats {
            total_records,
            group_count: groups.len(),
            duplicate_records,
            duplicate_ratio: if total_records == 0 {
                0.0
            } else {
                duplicate_records as f64 / total_records as f64
            },
            mean_similarity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn product(source_id: &str, title: &str, price: f64, supplier: &str, sales: u32) -> Product {
        let mut p = Product::new(source_id, title);
        p.price_min = Some(price);
        p.price_max = Some(price);
        p.moq = Some(100);
        p.supplier_source_id = Some(supplier.to_string());
        p.sales_count = sales;
        p
    }

    #[test]
    fn spacing_variants_normalize_identically() {
        let sim = TextSimilarity;
        assert_eq!(sim.score("红苹果 500g", "红苹果500g"), 1.0);
        assert!(sim.score("红苹果 500g", "绿梨 1kg") < 0.5);
    }

    #[test]
    fn verified_and_sales_win_master_election() {
        // A verified with lower sales, B unverified, C verified with the
        // highest sales: master must be C, A and B become duplicates of it.
        let a = product("A", "红苹果 500g", 2.5, "sup-a", 100);
        let b = product("B", "红苹果500g", 2.5, "sup-b", 900);
        let c = product("C", "红苹果  500g", 2.5, "sup-c", 500);

        let verified: HashSet<String> = ["sup-a".to_string(), "sup-c".to_string()].into();
        let deduper = Deduper::default();
        let groups = deduper.group_products(&[a, b, c], &verified);

        assert_eq!(groups.len(), 1);
        let group = &groups[0];
        assert_eq!(group.members, vec!["A".to_string(), "B".to_string(), "C".to_string()]);
        assert_eq!(group.master, "C");
        let duplicates: Vec<&String> = group.duplicates().collect();
        assert_eq!(duplicates.len(), 2);
    }

    #[test]
    fn earlier_created_at_breaks_sales_tie() {
        let mut a = product("A", "同款苹果", 2.5, "sup-x", 100);
        let mut b = product("B", "同款苹果", 2.5, "sup-y", 100);
        a.created_at = Utc::now() - Duration::days(10);
        b.created_at = Utc::now();

        let deduper = Deduper::default();
        let groups = deduper.group_products(&[a, b], &HashSet::new());
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].master, "A");
    }

    #[test]
    fn dissimilar_records_stay_ungrouped() {
        let a = product("A", "红苹果 500g", 2.5, "sup-a", 10);
        let b = product("B", "不锈钢水壶 2L", 45.0, "sup-b", 10);
        let deduper = Deduper::default();
        assert!(deduper.group_products(&[a, b], &HashSet::new()).is_empty());
    }

    #[test]
    fn dedup_is_stable_across_runs_and_input_order() {
        let a = product("A", "红苹果 500g", 2.5, "sup-a", 100);
        let b = product("B", "红苹果500g", 2.5, "sup-b", 900);
        let c = product("C", "红苹果  500g", 2.5, "sup-c", 500);
        let deduper = Deduper::default();
        let verified = HashSet::new();

        let forward = deduper.group_products(&[a.clone(), b.clone(), c.clone()], &verified);
        let reversed = deduper.group_products(&[c, b, a], &verified);

        assert_eq!(forward.len(), reversed.len());
        assert_eq!(forward[0].group_id, reversed[0].group_id);
        assert_eq!(forward[0].members, reversed[0].members);
        assert_eq!(forward[0].master, reversed[0].master);
    }

    #[test]
    fn stats_reflect_grouping() {
        let a = product("A", "同款", 1.0, "s", 1);
        let b = product("B", "同款", 1.0, "s", 2);
        let deduper = Deduper::default();
        let groups = deduper.group_products(&[a, b], &HashSet::new());
        let stats = deduper.stats(2, &groups);
        assert_eq!(stats.group_count, 1);
        assert_eq!(stats.duplicate_records, 1);
        assert!((stats.duplicate_ratio - 0.5).abs() < f64::EPSILON);
    }
}
