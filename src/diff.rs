//! Edit scripts between consecutive snapshots.
//!
//! Items are matched by stable id in a single pass over each side using
//! id -> index maps. Shared items whose old positions form the longest
//! increasing run in the new order stay put; every other shared item is moved.
//! Inserts and deletes alone never produce moves, and the moved set is the
//! smallest one that explains the reordering.
//!
//! A shared item that changed is reported as `Updated` whether or not it also
//! moved.
//!
//! Index conventions: `Deleted` and `Moved::from` index the old snapshot,
//! `Inserted`, `Updated` and `Moved::to` index the new one.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use serde_json::Value;

use crate::cache::Entity;

/// One edit between two snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectionUpdate {
  Inserted(usize),
  Deleted(usize),
  Updated(usize),
  Moved { from: usize, to: usize },
}

/// Diff two entity snapshots keyed by `Entity::id`.
pub fn diff<E: Entity>(old: &[E], new: &[E]) -> Vec<CollectionUpdate> {
  diff_by(old, new, |e| e.id(), |a, b| a == b)
}

/// Diff two sequences with a custom identity and equality.
///
/// Duplicate keys are matched by first occurrence; later duplicates are
/// treated as unmatched.
pub fn diff_by<T, K, KF, EF>(old: &[T], new: &[T], key: KF, same: EF) -> Vec<CollectionUpdate>
where
  K: Hash + Eq,
  KF: Fn(&T) -> K,
  EF: Fn(&T, &T) -> bool,
{
  let mut old_index: HashMap<K, usize> = HashMap::with_capacity(old.len());
  for (i, item) in old.iter().enumerate() {
    old_index.entry(key(item)).or_insert(i);
  }

  // new position -> old position for matched pairs
  let mut matched_new: Vec<Option<usize>> = vec![None; new.len()];
  let mut matched_old: Vec<Option<usize>> = vec![None; old.len()];
  let mut seen_new: HashSet<K> = HashSet::with_capacity(new.len());
  for (j, item) in new.iter().enumerate() {
    let k = key(item);
    if let Some(&i) = old_index.get(&k) {
      if seen_new.contains(&k) {
        continue;
      }
      matched_new[j] = Some(i);
      matched_old[i] = Some(j);
    }
    seen_new.insert(k);
  }

  let shared: Vec<usize> = matched_new.iter().filter_map(|pair| *pair).collect();
  let mut stays = stationary(&shared).into_iter();

  let mut updates = Vec::new();
  let mut deletes = Vec::new();
  let mut inserts = Vec::new();
  let mut moves = Vec::new();

  for (i, pair) in matched_old.iter().enumerate() {
    if pair.is_none() {
      deletes.push(CollectionUpdate::Deleted(i));
    }
  }

  for (j, pair) in matched_new.iter().enumerate() {
    match *pair {
      None => inserts.push(CollectionUpdate::Inserted(j)),
      Some(i) => {
        if !stays.next().unwrap_or(true) {
          moves.push(CollectionUpdate::Moved { from: i, to: j });
        }
        if !same(&old[i], &new[j]) {
          updates.push(CollectionUpdate::Updated(j));
        }
      }
    }
  }

  updates.extend(deletes);
  updates.extend(inserts);
  updates.extend(moves);
  updates
}

/// Marks the entries of `seq` that belong to one longest strictly increasing
/// subsequence.
fn stationary(seq: &[usize]) -> Vec<bool> {
  // tails[k]: position in `seq` ending the smallest-valued run of length k + 1
  let mut tails: Vec<usize> = Vec::new();
  let mut prev: Vec<Option<usize>> = vec![None; seq.len()];
  for (p, &value) in seq.iter().enumerate() {
    let k = tails.partition_point(|&t| seq[t] < value);
    if k > 0 {
      prev[p] = Some(tails[k - 1]);
    }
    if k == tails.len() {
      tails.push(p);
    } else {
      tails[k] = p;
    }
  }

  let mut keep = vec![false; seq.len()];
  let mut cursor = tails.last().copied();
  while let Some(p) = cursor {
    keep[p] = true;
    cursor = prev[p];
  }
  keep
}

/// Replay `updates` against `old`, taking inserted, moved and updated values
/// from `new`. For updates produced by `diff(old, new)` this returns `new`.
pub fn apply<T: Clone>(updates: &[CollectionUpdate], old: &[T], new: &[T]) -> Vec<T> {
  let mut removed: Vec<usize> = Vec::new();
  let mut placed: Vec<usize> = Vec::new();
  let mut replaced: Vec<usize> = Vec::new();

  for update in updates {
    match *update {
      CollectionUpdate::Deleted(i) => removed.push(i),
      CollectionUpdate::Inserted(j) => placed.push(j),
      CollectionUpdate::Moved { from, to } => {
        removed.push(from);
        placed.push(to);
      }
      CollectionUpdate::Updated(j) => replaced.push(j),
    }
  }

  removed.sort_unstable();
  removed.dedup();
  placed.sort_unstable();
  placed.dedup();

  let mut result: Vec<T> = old.to_vec();
  for &i in removed.iter().rev() {
    if i < result.len() {
      result.remove(i);
    }
  }
  for &j in &placed {
    if let Some(value) = new.get(j) {
      let at = j.min(result.len());
      result.insert(at, value.clone());
    }
  }
  for &j in &replaced {
    if let (Some(slot), Some(value)) = (result.get_mut(j), new.get(j)) {
      *slot = value.clone();
    }
  }
  result
}

/// Snapshot items sharing a section key.
#[derive(Debug, Clone, PartialEq)]
pub struct Section<E> {
  pub key: String,
  pub items: Vec<E>,
}

/// Edit between two sectioned snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionUpdate {
  /// Section at this index of the new snapshot
  SectionInserted(usize),
  /// Section at this index of the old snapshot
  SectionDeleted(usize),
  /// Item edit inside a section present on both sides
  Item {
    old_section: usize,
    new_section: usize,
    update: CollectionUpdate,
  },
}

/// Text form of a section key; missing fields and nulls group under "".
pub fn section_label(doc: &Value, section_key: &str) -> String {
  match doc.get(section_key) {
    None | Some(Value::Null) => String::new(),
    Some(Value::String(s)) => s.clone(),
    Some(other) => other.to_string(),
  }
}

/// Split an ordered snapshot into sections, in order of first appearance.
///
/// Items with the same key that are not adjacent are still gathered into one
/// section.
pub fn group_sections<E: Entity>(items: &[E], section_key: &str) -> Vec<Section<E>> {
  let mut sections: Vec<Section<E>> = Vec::new();
  let mut by_key: HashMap<String, usize> = HashMap::new();
  for item in items {
    let label = serde_json::to_value(item)
      .map(|doc| section_label(&doc, section_key))
      .unwrap_or_default();
    match by_key.get(&label) {
      Some(&index) => sections[index].items.push(item.clone()),
      None => {
        by_key.insert(label.clone(), sections.len());
        sections.push(Section {
          key: label,
          items: vec![item.clone()],
        });
      }
    }
  }
  sections
}

/// Diff two sectioned snapshots.
///
/// Sections are matched by key. A section that changes rank is reported as a
/// delete plus an insert, and an item that changes section is reported as a
/// delete from the old section plus an insert into the new one.
pub fn diff_sections<E: Entity>(old: &[Section<E>], new: &[Section<E>]) -> Vec<SectionUpdate> {
  let section_edits = diff_by(old, new, |s| s.key.clone(), |_, _| true);

  let mut result = Vec::new();
  let mut gone = vec![false; old.len()];
  let mut fresh = vec![false; new.len()];
  for edit in &section_edits {
    match *edit {
      CollectionUpdate::Deleted(i) => gone[i] = true,
      CollectionUpdate::Inserted(j) => fresh[j] = true,
      CollectionUpdate::Moved { from, to } => {
        gone[from] = true;
        fresh[to] = true;
      }
      CollectionUpdate::Updated(_) => {}
    }
  }

  for (i, removed) in gone.iter().enumerate() {
    if *removed {
      result.push(SectionUpdate::SectionDeleted(i));
    }
  }
  for (j, added) in fresh.iter().enumerate() {
    if *added {
      result.push(SectionUpdate::SectionInserted(j));
    }
  }

  let old_by_key: HashMap<&str, usize> = old
    .iter()
    .enumerate()
    .filter(|(i, _)| !gone[*i])
    .map(|(i, s)| (s.key.as_str(), i))
    .collect();
  for (j, section) in new.iter().enumerate() {
    if fresh[j] {
      continue;
    }
    let Some(&i) = old_by_key.get(section.key.as_str()) else {
      continue;
    };
    for update in diff(&old[i].items, &section.items) {
      result.push(SectionUpdate::Item {
        old_section: i,
        new_section: j,
        update,
      });
    }
  }
  result
}

/// Replay section updates; the sectioned counterpart of `apply`.
pub fn apply_sections<E: Entity>(updates: &[SectionUpdate], old: &[Section<E>], new: &[Section<E>]) -> Vec<Section<E>> {
  let mut section_edits = Vec::new();
  let mut item_edits: HashMap<(usize, usize), Vec<CollectionUpdate>> = HashMap::new();
  for update in updates {
    match *update {
      SectionUpdate::SectionDeleted(i) => section_edits.push(CollectionUpdate::Deleted(i)),
      SectionUpdate::SectionInserted(j) => section_edits.push(CollectionUpdate::Inserted(j)),
      SectionUpdate::Item {
        old_section,
        new_section,
        update,
      } => item_edits.entry((old_section, new_section)).or_default().push(update),
    }
  }

  let mut sections = apply(&section_edits, old, new);
  for ((i, j), edits) in item_edits {
    if let (Some(from), Some(to), Some(slot)) = (old.get(i), new.get(j), sections.get_mut(j)) {
      slot.items = apply(&edits, &from.items, &to.items);
    }
  }
  sections
}
