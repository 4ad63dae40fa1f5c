//! Merging a repair batch back into a session's artifact set.
//!
//! Accepted artifacts are cloned into the output and never taken from the
//! fix batch, so a model that resends an accepted contract cannot change it.
//! Output order is the order fixed by the first generation response.

use std::collections::{HashMap, HashSet};

use kiln_common::Artifact;

use crate::errors::MergeError;

/// Build the next full, ordered artifact set.
///
/// `accepted` is left untouched; every entry taken from it is a deep copy.
/// A slot with neither an accepted artifact nor a fix-batch entry is an
/// integrity failure.
pub fn merge(
    accepted: &[Artifact],
    fix_batch: Vec<Artifact>,
    original_order: &[String],
) -> Result<Vec<Artifact>, MergeError> {
    let accepted: HashMap<&str, &Artifact> =
        accepted.iter().map(|a| (a.name.as_str(), a)).collect();

    let mut batch = dedup_batch(fix_batch);
    let accepted_names: HashSet<&str> = accepted.keys().copied().collect();
    reconcile_names(&mut batch, &accepted_names, original_order)?;

    let mut fixes: HashMap<String, Artifact> =
        batch.into_iter().map(|a| (a.name.clone(), a)).collect();

    let mut merged = Vec::with_capacity(original_order.len());
    for (position, name) in original_order.iter().enumerate() {
        let mut artifact = match accepted.get(name.as_str()) {
            Some(kept) => {
                if fixes.remove(name).is_some() {
                    tracing::warn!(artifact = %name, "fix batch resent an accepted artifact; discarded");
                }
                (*kept).clone()
            }
            None => fixes
                .remove(name)
                .ok_or_else(|| MergeError::MissingArtifact { name: name.clone() })?,
        };
        artifact.order = position;
        merged.push(artifact);
    }

    Ok(merged)
}

/// Keep the first entry for each name.
fn dedup_batch(batch: Vec<Artifact>) -> Vec<Artifact> {
    let mut seen = HashSet::new();
    batch
        .into_iter()
        .filter(|artifact| {
            let first = seen.insert(artifact.name.clone());
            if !first {
                tracing::warn!(artifact = %artifact.name, "duplicate name in fix batch; keeping first");
            }
            first
        })
        .collect()
}

fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Map names the fix batch invented back onto expected names it is missing.
///
/// With exactly one unknown and one missing name the pair is matched by
/// elimination. Otherwise each unknown name must match exactly one missing
/// name after case and punctuation are stripped. Two renames whose
/// normalized forms collide can still be paired wrongly.
pub fn reconcile_names(
    batch: &mut [Artifact],
    accepted: &HashSet<&str>,
    original_order: &[String],
) -> Result<(), MergeError> {
    let expected: HashSet<&str> = original_order.iter().map(String::as_str).collect();
    let unknown: Vec<usize> = batch
        .iter()
        .enumerate()
        .filter(|(_, a)| !expected.contains(a.name.as_str()))
        .map(|(i, _)| i)
        .collect();
    if unknown.is_empty() {
        return Ok(());
    }

    let present: HashSet<&str> = batch.iter().map(|a| a.name.as_str()).collect();
    let missing: Vec<String> = original_order
        .iter()
        .filter(|name| !accepted.contains(name.as_str()) && !present.contains(name.as_str()))
        .cloned()
        .collect();

    if missing.is_empty() {
        return Err(MergeError::UnexpectedArtifact {
            name: batch[unknown[0]].name.clone(),
        });
    }

    if unknown.len() == 1 && missing.len() == 1 {
        let artifact = &mut batch[unknown[0]];
        tracing::info!(from = %artifact.name, to = %missing[0], "reconciled renamed artifact");
        artifact.name = missing[0].clone();
        return Ok(());
    }

    let mut assignments = Vec::with_capacity(unknown.len());
    let mut claimed = HashSet::new();
    for &index in &unknown {
        let key = normalize(&batch[index].name);
        let candidates: Vec<&String> = missing.iter().filter(|m| normalize(m) == key).collect();
        match candidates.as_slice() {
            [only] if claimed.insert(only.as_str()) => assignments.push((index, (*only).clone())),
            _ => {
                return Err(MergeError::AmbiguousRename {
                    unknown: unknown.iter().map(|&i| batch[i].name.clone()).collect(),
                    missing: missing.clone(),
                });
            }
        }
    }

    for (index, name) in assignments {
        tracing::info!(from = %batch[index].name, to = %name, "reconciled renamed artifact");
        batch[index].name = name;
    }
    Ok(())
}
