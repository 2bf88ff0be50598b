//! Multi-run stability check.
//!
//! A server can hand the scanner a harmless description and a real agent a
//! poisoned one. Listing the server several times and comparing the runs
//! catches servers that vary their answers at all.

use std::collections::BTreeMap;

use tripwire_registry::{EntityHash, EntityKind};

use crate::report::EntityResult;
use crate::verdict::{Flag, Verdict};

type EntityKey = (EntityKind, String);

#[derive(Default)]
struct Observations {
    hashes: Vec<EntityHash>,
    verdicts: Vec<&'static str>,
    present: usize,
}

/// Merges the results of `runs` listings of one server.
///
/// The last run is reported. Entities whose hash or verdict varied, or that
/// were missing from some runs, get a [`Flag::NonDeterministic`] and a
/// flagged verdict. Entities that vanished before the last run are carried
/// over from the latest run that had them.
pub fn merge_runs(mut runs: Vec<Vec<EntityResult>>) -> Vec<EntityResult> {
    let total = runs.len();
    if total <= 1 {
        return runs.pop().unwrap_or_default();
    }

    let mut observed: BTreeMap<EntityKey, Observations> = BTreeMap::new();
    for run in &runs {
        for result in run {
            let obs = observed.entry(key(result)).or_default();
            if !obs.hashes.contains(&result.hash) {
                obs.hashes.push(result.hash);
            }
            let label = result.verdict.label();
            if !obs.verdicts.contains(&label) {
                obs.verdicts.push(label);
            }
            obs.present += 1;
        }
    }

    let mut merged: Vec<EntityResult> = Vec::new();
    let mut seen: Vec<EntityKey> = Vec::new();
    for run in runs.into_iter().rev() {
        for result in run {
            let k = key(&result);
            if seen.contains(&k) {
                continue;
            }
            seen.push(k);
            merged.push(result);
        }
    }
    // Last run first in `merged`; restore a stable listing order.
    merged.reverse();

    for result in &mut merged {
        let Some(obs) = observed.get(&key(result)) else {
            continue;
        };
        let mut varied = Vec::new();
        if obs.hashes.len() > 1 {
            varied.push("definition".to_string());
        }
        if obs.verdicts.len() > 1 {
            varied.push(format!("verdict ({})", obs.verdicts.join("/")));
        }
        if obs.present < total {
            varied.push(format!("present in {} of {} listings", obs.present, total));
        }
        if varied.is_empty() {
            continue;
        }

        result.flags.push(Flag::NonDeterministic {
            runs: total as u32,
            distinct_hashes: obs.hashes.len(),
            detail: varied.join(", "),
        });
        if !result.verdict.is_flagged() {
            result.verdict = Verdict::flagged("definition varies between listings");
            result.remediation =
                Some("the server answers differently on each listing; do not trust it".to_string());
        }
    }
    merged
}

fn key(result: &EntityResult) -> EntityKey {
    (result.entity.kind, result.entity.name.clone())
}
