//! Hotspot analysis for collected profiles
//!
//! Aggregates a materialized profile's samples by executing function to
//! rank the functions that consumed the most CPU time. Pure
//! post-processing over a [`CpuProfile`]; no new concurrency.

// Percentage calculations intentionally convert u64 to f64
#![allow(clippy::cast_precision_loss)]

use std::collections::HashMap;

use crate::profiling::CpuProfile;

/// A function hotspot with aggregated statistics.
#[derive(Debug, Clone)]
pub struct FunctionHotspot {
    /// Function name, as resolved during materialization.
    pub name: String,

    /// Source file of the function.
    pub filename: String,

    /// Line observed on the first sample attributed to this function.
    pub line: i32,

    /// Total sample count attributed to this function.
    pub count: u64,

    /// Percentage of total samples (0.0 - 100.0).
    pub percentage: f64,
}

/// Analyze a profile to identify function hotspots.
///
/// Attribution is by leaf frame: each trace's samples count toward the
/// function that was actually executing when the sample fired.
/// Hotspots are sorted by count, most frequent first.
#[must_use]
pub fn analyze_hotspots(profile: &CpuProfile) -> Vec<FunctionHotspot> {
    let mut function_data: HashMap<(String, String), (u64, i32)> = HashMap::new();
    let mut total_samples: u64 = 0;

    for (trace, &count) in profile.samples() {
        // Traces are ordered innermost first; the leaf is the executing
        // function.
        let Some(leaf) = trace.first() else {
            continue;
        };
        total_samples += count;

        let entry = function_data
            .entry((leaf.name.clone(), leaf.filename.clone()))
            .or_insert((0, leaf.line));
        entry.0 += count;
    }

    let mut hotspots: Vec<FunctionHotspot> = function_data
        .into_iter()
        .map(|((name, filename), (count, line))| {
            let percentage = if total_samples > 0 {
                (count as f64 / total_samples as f64) * 100.0
            } else {
                0.0
            };
            FunctionHotspot { name, filename, line, count, percentage }
        })
        .collect();

    // Sort by count (descending) - unstable sort is faster
    hotspots.sort_unstable_by_key(|h| std::cmp::Reverse(h.count));

    hotspots
}
