//! Progression engine for simulated-world agent economies.
//!
//! Agents earn currency from elapsed simulated days and kills, then spend it
//! against per-species upgrade catalogs. The engine keeps every mutation of
//! live agent state on the single simulation thread: large populations are
//! served by a batch scheduler whose calculate phase runs on a worker pool
//! over immutable snapshots, and an adaptive throttle bounds how often any
//! named operation may run per agent.

use rand::{Rng, RngCore, SeedableRng, rngs::SmallRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use slotmap::{SecondaryMap, SlotMap, new_key_type};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

new_key_type! {
    /// Stable handle for an agent tracked by the engine.
    pub struct AgentId;
}

/// Dense per-agent storage keyed by [`AgentId`].
pub type AgentMap<T> = SecondaryMap<AgentId, T>;

/// Monotonic simulation step counter supplied by the world clock.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Tick(pub u64);

/// Identifies a species and selects its upgrade catalog.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpeciesKey(String);

impl SpeciesKey {
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SpeciesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies a single purchasable upgrade within a catalog.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UpgradeKey(String);

impl UpgradeKey {
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UpgradeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies an archetype tree used by the deterministic walker.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArchetypeKey(String);

impl ArchetypeKey {
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArchetypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stat channels an upgrade may boost.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatKind {
    Health,
    Damage,
    Speed,
    Resistance,
}

/// Equipment slots an upgrade tier may fill.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GearSlot {
    Weapon,
    Shield,
    Helmet,
    Chest,
    Legs,
    Boots,
}

/// Triggered abilities an upgrade may unlock.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbilityKind {
    HealingBurst,
    Vanish,
}

/// What owning levels of an upgrade does to an agent.
///
/// Resolved once at catalog load; the engine never inspects free-form
/// strings at runtime. The effect/equipment applier collaborator receives
/// the descriptor together with the new level during the apply phase.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EffectDescriptor {
    /// Flat additive boost to a stat per owned level.
    StatBoost { stat: StatKind, per_level: f64 },
    /// Owned level indexes into an equipment ladder for the slot.
    EquipmentTier { slot: GearSlot },
    /// Periodic status buff refreshed by the applier; duration scales with level.
    TimedBuff { stat: StatKind, seconds: u32 },
    /// Chance-on-trigger ability; chance grows with level.
    Ability {
        ability: AbilityKind,
        chance_per_level: f64,
    },
}

/// A single purchasable upgrade: key, per-level cost table, effect.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpgradeDef {
    pub key: UpgradeKey,
    /// Cost of reaching level `i + 1` is `costs[i]`. Length is the max level.
    pub costs: Vec<u32>,
    pub effect: EffectDescriptor,
}

impl UpgradeDef {
    #[must_use]
    pub fn max_level(&self) -> u16 {
        self.costs.len().min(u16::MAX as usize) as u16
    }

    /// Cost of buying `next_level` (1-based). `None` past the top.
    #[must_use]
    pub fn cost_for(&self, next_level: u16) -> Option<u32> {
        if next_level == 0 {
            return None;
        }
        self.costs.get(next_level as usize - 1).copied()
    }
}

/// One band of the daily accrual schedule. `to: None` marks the open tail.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DayRange {
    pub from: u32,
    #[serde(default)]
    pub to: Option<u32>,
    pub rate: f64,
}

/// Ordered day ranges mapping elapsed days to points per day.
///
/// Ranges must start at day 1, be contiguous, and end with exactly one
/// open-ended band. Gaps and overlaps are load-time errors; the original
/// data this replaces silently gap-filled at a default rate, which hid
/// configuration mistakes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DailyRateTable {
    ranges: Vec<DayRange>,
}

impl DailyRateTable {
    pub fn new(ranges: Vec<DayRange>) -> Result<Self, CatalogError> {
        let table = Self { ranges };
        table.validate()?;
        Ok(table)
    }

    /// The widely used six-band schedule: slow opening, steep endgame.
    #[must_use]
    pub fn standard() -> Self {
        Self {
            ranges: vec![
                DayRange {
                    from: 1,
                    to: Some(10),
                    rate: 0.1,
                },
                DayRange {
                    from: 11,
                    to: Some(15),
                    rate: 0.5,
                },
                DayRange {
                    from: 16,
                    to: Some(20),
                    rate: 1.0,
                },
                DayRange {
                    from: 21,
                    to: Some(25),
                    rate: 1.5,
                },
                DayRange {
                    from: 26,
                    to: Some(30),
                    rate: 3.0,
                },
                DayRange {
                    from: 31,
                    to: None,
                    rate: 5.0,
                },
            ],
        }
    }

    pub fn validate(&self) -> Result<(), CatalogError> {
        let Some(first) = self.ranges.first() else {
            return Err(CatalogError::RatesEmpty);
        };
        if first.from != 1 {
            return Err(CatalogError::RatesStart { from: first.from });
        }
        let mut expected_from = 1u32;
        for (i, range) in self.ranges.iter().enumerate() {
            if range.rate < 0.0 {
                return Err(CatalogError::NegativeRate { from: range.from });
            }
            if range.from != expected_from {
                return Err(CatalogError::RatesGap { day: expected_from });
            }
            match range.to {
                Some(to) => {
                    if to < range.from {
                        return Err(CatalogError::RatesGap { day: range.from });
                    }
                    if i + 1 == self.ranges.len() {
                        return Err(CatalogError::RatesBoundedTail);
                    }
                    expected_from = to + 1;
                }
                None => {
                    if i + 1 != self.ranges.len() {
                        return Err(CatalogError::RatesGap { day: range.from });
                    }
                }
            }
        }
        Ok(())
    }

    /// Points accumulated over days `1..=day`. Day 0 earns nothing.
    #[must_use]
    pub fn points_through(&self, day: u32) -> f64 {
        let mut points = 0.0;
        for range in &self.ranges {
            if day < range.from {
                break;
            }
            let last = match range.to {
                Some(to) => day.min(to),
                None => day,
            };
            points += f64::from(last - range.from + 1) * range.rate;
        }
        points
    }

    /// Rate applying to a single day, linear scan over the ordered bands.
    #[must_use]
    pub fn rate_for(&self, day: u32) -> f64 {
        for range in &self.ranges {
            let within_upper = range.to.is_none_or(|to| day <= to);
            if day >= range.from && within_upper {
                return range.rate;
            }
        }
        0.0
    }

    #[must_use]
    pub fn ranges(&self) -> &[DayRange] {
        &self.ranges
    }
}

fn default_save_chance() -> f64 {
    0.20
}

fn default_kill_points() -> f64 {
    1.0
}

/// Immutable per-species upgrade definitions, shared read-only as an `Arc`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpgradeCatalog {
    pub species: SpeciesKey,
    /// Probability the spend loop banks the remaining budget instead of buying.
    #[serde(default = "default_save_chance")]
    pub save_chance: f64,
    /// Currency earned per kill.
    #[serde(default = "default_kill_points")]
    pub kill_points: f64,
    pub daily_rates: DailyRateTable,
    pub upgrades: Vec<UpgradeDef>,
}

impl UpgradeCatalog {
    pub fn validate(&self) -> Result<(), CatalogError> {
        if self.upgrades.is_empty() {
            return Err(CatalogError::NoUpgrades {
                species: self.species.clone(),
            });
        }
        if !(0.0..1.0).contains(&self.save_chance) {
            return Err(CatalogError::SaveChance {
                value: self.save_chance,
            });
        }
        if self.kill_points < 0.0 {
            return Err(CatalogError::NegativeKillPoints {
                value: self.kill_points,
            });
        }
        self.daily_rates.validate()?;
        let mut seen = HashSet::new();
        for def in &self.upgrades {
            if !seen.insert(&def.key) {
                return Err(CatalogError::DuplicateUpgrade {
                    species: self.species.clone(),
                    key: def.key.clone(),
                });
            }
            if def.costs.is_empty() {
                return Err(CatalogError::EmptyCosts {
                    key: def.key.clone(),
                });
            }
            for (i, &cost) in def.costs.iter().enumerate() {
                if cost == 0 {
                    return Err(CatalogError::ZeroCost {
                        key: def.key.clone(),
                        level: i as u16 + 1,
                    });
                }
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn get(&self, key: &UpgradeKey) -> Option<&UpgradeDef> {
        self.upgrades.iter().find(|def| &def.key == key)
    }
}

/// Validated catalogs keyed by species. Species whose catalog fails
/// validation are excluded: their agents never accrue or spend.
#[derive(Debug, Default)]
pub struct CatalogLibrary {
    catalogs: HashMap<SpeciesKey, Arc<UpgradeCatalog>>,
}

impl CatalogLibrary {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and registers one catalog, replacing any prior entry for
    /// the species.
    pub fn insert(&mut self, catalog: UpgradeCatalog) -> Result<(), CatalogError> {
        catalog.validate()?;
        self.catalogs
            .insert(catalog.species.clone(), Arc::new(catalog));
        Ok(())
    }

    /// Loads a whole JSON document of catalogs. A malformed document is an
    /// error; an individually invalid catalog is logged and skipped so one
    /// bad species cannot take the rest down.
    pub fn load_json(doc: &str) -> Result<Self, serde_json::Error> {
        let parsed: Vec<UpgradeCatalog> = serde_json::from_str(doc)?;
        let mut library = Self::new();
        for catalog in parsed {
            let species = catalog.species.clone();
            if let Err(err) = library.insert(catalog) {
                warn!(species = %species, error = %err, "catalog rejected; species excluded from progression");
            }
        }
        Ok(library)
    }

    #[must_use]
    pub fn get(&self, species: &SpeciesKey) -> Option<&Arc<UpgradeCatalog>> {
        self.catalogs.get(species)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.catalogs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.catalogs.is_empty()
    }

    pub fn species(&self) -> impl Iterator<Item = &SpeciesKey> {
        self.catalogs.keys()
    }
}

/// One node of an archetype tree: an upgrade purchase gated by cost and tier.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    pub upgrade: UpgradeKey,
    pub cost: u32,
    #[serde(default)]
    pub tier_requirement: u8,
    /// Indices into the owning tree's node arena.
    #[serde(default)]
    pub children: Vec<usize>,
}

/// Rooted upgrade tree for one archetype; node 0 is the root.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArchetypeTree {
    pub archetype: ArchetypeKey,
    nodes: Vec<TreeNode>,
}

impl ArchetypeTree {
    pub fn new(archetype: ArchetypeKey, nodes: Vec<TreeNode>) -> Result<Self, CatalogError> {
        let tree = Self { archetype, nodes };
        tree.validate()?;
        Ok(tree)
    }

    /// Walks every edge from the root, rejecting dangling indices and any
    /// node reachable twice (cycles and diamonds both break walk idempotence).
    pub fn validate(&self) -> Result<(), CatalogError> {
        if self.nodes.is_empty() {
            return Err(CatalogError::EmptyTree {
                archetype: self.archetype.clone(),
            });
        }
        let mut visited = vec![false; self.nodes.len()];
        let mut stack = vec![0usize];
        while let Some(idx) = stack.pop() {
            let Some(node) = self.nodes.get(idx) else {
                return Err(CatalogError::DanglingChild {
                    archetype: self.archetype.clone(),
                    index: idx,
                });
            };
            if visited[idx] {
                return Err(CatalogError::RevisitedNode {
                    archetype: self.archetype.clone(),
                    index: idx,
                });
            }
            visited[idx] = true;
            for &child in &node.children {
                if child >= self.nodes.len() {
                    return Err(CatalogError::DanglingChild {
                        archetype: self.archetype.clone(),
                        index: child,
                    });
                }
                stack.push(child);
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn node(&self, index: usize) -> Option<&TreeNode> {
        self.nodes.get(index)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Archetype trees keyed for the walker. `BTreeMap` keeps key order stable
/// so deterministic path switches pick the same alternative every run.
#[derive(Debug, Default)]
pub struct TreeSet {
    trees: BTreeMap<ArchetypeKey, Arc<ArchetypeTree>>,
}

impl TreeSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tree: ArchetypeTree) -> Result<(), CatalogError> {
        tree.validate()?;
        self.trees.insert(tree.archetype.clone(), Arc::new(tree));
        Ok(())
    }

    /// Same exclusion policy as [`CatalogLibrary::load_json`].
    pub fn load_json(doc: &str) -> Result<Self, serde_json::Error> {
        let parsed: Vec<ArchetypeTree> = serde_json::from_str(doc)?;
        let mut set = Self::new();
        for tree in parsed {
            let archetype = tree.archetype.clone();
            if let Err(err) = set.insert(tree) {
                warn!(archetype = %archetype, error = %err, "archetype tree rejected");
            }
        }
        Ok(set)
    }

    #[must_use]
    pub fn get(&self, archetype: &ArchetypeKey) -> Option<&Arc<ArchetypeTree>> {
        self.trees.get(archetype)
    }

    pub fn keys(&self) -> impl Iterator<Item = &ArchetypeKey> {
        self.trees.keys()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.trees.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.trees.is_empty()
    }
}

/// Catalog and tree validation failures.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CatalogError {
    #[error("species `{species}` declares no upgrades")]
    NoUpgrades { species: SpeciesKey },
    #[error("species `{species}` repeats upgrade key `{key}`")]
    DuplicateUpgrade { species: SpeciesKey, key: UpgradeKey },
    #[error("upgrade `{key}` has an empty cost table")]
    EmptyCosts { key: UpgradeKey },
    #[error("upgrade `{key}` costs nothing at level {level}")]
    ZeroCost { key: UpgradeKey, level: u16 },
    #[error("save chance {value} must lie in [0, 1)")]
    SaveChance { value: f64 },
    #[error("kill points {value} must be non-negative")]
    NegativeKillPoints { value: f64 },
    #[error("daily rate table is empty")]
    RatesEmpty,
    #[error("daily rates must begin at day 1, not day {from}")]
    RatesStart { from: u32 },
    #[error("daily rates are not contiguous at day {day}")]
    RatesGap { day: u32 },
    #[error("the final daily rate range must be open-ended")]
    RatesBoundedTail,
    #[error("daily rate for days {from}+ is negative")]
    NegativeRate { from: u32 },
    #[error("archetype tree `{archetype}` has no nodes")]
    EmptyTree { archetype: ArchetypeKey },
    #[error("archetype tree `{archetype}` references missing node {index}")]
    DanglingChild { archetype: ArchetypeKey, index: usize },
    #[error("archetype tree `{archetype}` reaches node {index} twice")]
    RevisitedNode { archetype: ArchetypeKey, index: usize },
}

/// Engine construction and configuration failures.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("worker pool: {0}")]
    WorkerPool(String),
}

/// Lifetime progression record for one agent.
///
/// Owned exclusively by the engine on the simulation thread; batch workers
/// only ever see cloned snapshots. Day and kill points are tracked apart so
/// a clock rollback can clamp day accrual without touching kill earnings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentProgress {
    species: SpeciesKey,
    day_points: f64,
    kill_points: f64,
    spent_points: f64,
    levels: HashMap<UpgradeKey, u16>,
    tier: u8,
    priority_path: Option<ArchetypeKey>,
    last_evaluated_step: Tick,
}

impl AgentProgress {
    #[must_use]
    pub fn new(species: SpeciesKey) -> Self {
        Self {
            species,
            day_points: 0.0,
            kill_points: 0.0,
            spent_points: 0.0,
            levels: HashMap::new(),
            tier: 0,
            priority_path: None,
            last_evaluated_step: Tick(0),
        }
    }

    /// Rebuilds a record from persisted fields. Spent points are clamped
    /// into `[0, total]` so a corrupt row cannot produce a negative budget.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        species: SpeciesKey,
        day_points: f64,
        kill_points: f64,
        spent_points: f64,
        levels: HashMap<UpgradeKey, u16>,
        tier: u8,
        priority_path: Option<ArchetypeKey>,
        last_evaluated_step: Tick,
    ) -> Self {
        let day_points = day_points.max(0.0);
        let kill_points = kill_points.max(0.0);
        Self {
            species,
            day_points,
            kill_points,
            spent_points: spent_points.clamp(0.0, day_points + kill_points),
            levels,
            tier,
            priority_path,
            last_evaluated_step,
        }
    }

    #[must_use]
    pub fn species(&self) -> &SpeciesKey {
        &self.species
    }

    /// Lifetime currency earned. Never decreases.
    #[must_use]
    pub fn total_points(&self) -> f64 {
        self.day_points + self.kill_points
    }

    #[must_use]
    pub fn day_points(&self) -> f64 {
        self.day_points
    }

    #[must_use]
    pub fn kill_points(&self) -> f64 {
        self.kill_points
    }

    #[must_use]
    pub fn spent_points(&self) -> f64 {
        self.spent_points
    }

    /// Whole points currently available to spend.
    #[must_use]
    pub fn budget(&self) -> u32 {
        (self.total_points() - self.spent_points).floor().max(0.0) as u32
    }

    #[must_use]
    pub fn level(&self, key: &UpgradeKey) -> u16 {
        self.levels.get(key).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn levels(&self) -> &HashMap<UpgradeKey, u16> {
        &self.levels
    }

    #[must_use]
    pub fn tier(&self) -> u8 {
        self.tier
    }

    #[must_use]
    pub fn priority_path(&self) -> Option<&ArchetypeKey> {
        self.priority_path.as_ref()
    }

    pub fn set_priority_path(&mut self, path: ArchetypeKey) {
        self.priority_path = Some(path);
    }

    #[must_use]
    pub fn last_evaluated_step(&self) -> Tick {
        self.last_evaluated_step
    }

    /// Brings day accrual up to `day` of the schedule and returns the points
    /// gained. A smaller day than previously seen (clock rollback) keeps the
    /// cached value: total points never regress under already-applied levels.
    pub fn accrue_through_day(&mut self, day: u32, rates: &DailyRateTable, step: Tick) -> f64 {
        let target = rates.points_through(day);
        let gained = (target - self.day_points).max(0.0);
        self.day_points += gained;
        self.last_evaluated_step = step;
        gained
    }

    pub fn record_kill(&mut self, points: f64) {
        self.kill_points += points.max(0.0);
    }

    /// Raises the tier counter, never lowering it.
    pub fn raise_tier(&mut self, tier: u8) {
        self.tier = self.tier.max(tier);
    }

    pub fn set_level(&mut self, key: UpgradeKey, level: u16) {
        if level == 0 {
            self.levels.remove(&key);
        } else {
            self.levels.insert(key, level);
        }
    }

    /// Adds to spent points, clamping at the earned total. Returns the delta
    /// actually applied; a shortfall means a stale caller and is logged.
    pub fn add_spent(&mut self, points: f64) -> f64 {
        let before = self.spent_points;
        let target = before + points.max(0.0);
        let applied = target.min(self.total_points());
        if applied < target {
            warn!(
                species = %self.species,
                requested = points,
                applied = applied - before,
                "spend exceeded earned total; clamped"
            );
        }
        self.spent_points = applied;
        applied - before
    }

    pub fn mark_evaluated(&mut self, step: Tick) {
        self.last_evaluated_step = step;
    }
}

/// Hard stop for the spend loop. A misconfigured catalog must not be able to
/// hang a worker, so the loop aborts after this many passes and logs.
pub const ALLOCATION_ITERATION_CAP: u32 = 10_000;

/// Why an allocation pass stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// The save roll banked the remaining budget unspent.
    Saved,
    /// No affordable candidate remained.
    Exhausted,
    /// The iteration cap tripped.
    CapHit,
}

/// Levels bought by one allocation pass and the whole points consumed.
#[derive(Clone, Debug, PartialEq)]
pub struct AllocationOutcome {
    /// Changed upgrades only, mapped to their new level.
    pub new_levels: HashMap<UpgradeKey, u16>,
    pub points_spent: u32,
    pub iterations: u32,
    pub stop: StopReason,
}

/// Budget-constrained spend loop, shared verbatim by the synchronous path
/// and the batch workers.
///
/// Each pass collects every upgrade whose next level is affordable, rolls
/// the catalog's save chance to possibly stop, then buys one candidate
/// uniformly at random. The loop is reentrant: a later call with a larger
/// budget continues from the levels it is given and never re-rolls past
/// decisions. `deadline` is the cooperative cancellation point for batch
/// workers; `None` means the pass ran out of time and nothing of it may be
/// applied.
pub fn allocate(
    progress: &AgentProgress,
    catalog: &UpgradeCatalog,
    rng: &mut SmallRng,
    deadline: Option<Instant>,
) -> Option<AllocationOutcome> {
    let mut budget = progress.budget();
    let mut levels = progress.levels().clone();
    let mut changed: HashMap<UpgradeKey, u16> = HashMap::new();
    let mut points_spent = 0u32;
    let mut iterations = 0u32;
    let mut candidates: Vec<(usize, u32)> = Vec::new();
    let stop;
    loop {
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return None;
            }
        }
        if iterations >= ALLOCATION_ITERATION_CAP {
            warn!(
                species = %catalog.species,
                iterations,
                "allocation iteration cap reached"
            );
            stop = StopReason::CapHit;
            break;
        }
        iterations += 1;

        candidates.clear();
        for (idx, def) in catalog.upgrades.iter().enumerate() {
            let level = levels.get(&def.key).copied().unwrap_or(0);
            if level >= def.max_level() {
                continue;
            }
            if let Some(cost) = def.cost_for(level + 1) {
                if cost <= budget {
                    candidates.push((idx, cost));
                }
            }
        }
        if candidates.is_empty() {
            stop = StopReason::Exhausted;
            break;
        }
        if rng.random::<f64>() < catalog.save_chance {
            stop = StopReason::Saved;
            break;
        }
        let (idx, cost) = candidates[rng.random_range(0..candidates.len())];
        let key = catalog.upgrades[idx].key.clone();
        let next = levels.get(&key).copied().unwrap_or(0) + 1;
        levels.insert(key.clone(), next);
        changed.insert(key, next);
        budget -= cost;
        points_spent += cost;
    }
    Some(AllocationOutcome {
        new_levels: changed,
        points_spent,
        iterations,
        stop,
    })
}

/// Chance, rolled once per tier increase, that a walk switches the agent's
/// priority path to a different archetype tree.
pub const PATH_SWITCH_CHANCE: f64 = 0.10;

/// Everything one deterministic walk decided.
#[derive(Clone, Debug, PartialEq)]
pub struct WalkOutcome {
    /// Purchases in walk order. A key repeats when the tree sells the same
    /// upgrade at several depths; each purchase is one level.
    pub purchased: Vec<UpgradeKey>,
    pub points_spent: u32,
    pub tier: u8,
    /// Path the agent should start its next walk from.
    pub priority_path: ArchetypeKey,
}

fn tier_switch_seed(world_seed: u64, identity_bits: u64, tier: u8) -> u64 {
    world_seed ^ identity_bits ^ u64::from(tier).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

/// Seeded pseudo-random walk down an archetype tree, reproducible from
/// `(world_seed, identity_bits, points)` alone.
///
/// Child choices are drawn from a generator seeded with
/// `world_seed ^ identity_bits`, so a later walk with more points follows
/// the identical path further down rather than re-deciding it. Each tier
/// increase rolls a one-shot generator that also folds in the new tier
/// number: with [`PATH_SWITCH_CHANCE`] the returned priority path moves to
/// another tree (picked among the remaining keys in sorted order), while
/// the walk itself finishes in the tree it started in.
///
/// Returns `None` when no tree exists for `start`.
pub fn walk_tree(
    trees: &TreeSet,
    start: &ArchetypeKey,
    world_seed: u64,
    identity_bits: u64,
    points: f64,
) -> Option<WalkOutcome> {
    let tree = trees.get(start)?;
    let mut rng = SmallRng::seed_from_u64(world_seed ^ identity_bits);
    let mut remaining = points.floor().max(0.0) as u32;
    let mut purchased = Vec::new();
    let mut points_spent = 0u32;
    let mut tier = 0u8;
    let mut priority_path = start.clone();
    let mut index = 0usize;
    loop {
        let Some(node) = tree.node(index) else {
            break;
        };
        if node.cost > remaining {
            break;
        }
        remaining -= node.cost;
        points_spent += node.cost;
        purchased.push(node.upgrade.clone());
        if node.tier_requirement > tier {
            tier = node.tier_requirement;
            let mut switch_rng =
                SmallRng::seed_from_u64(tier_switch_seed(world_seed, identity_bits, tier));
            if switch_rng.random_bool(PATH_SWITCH_CHANCE) {
                let alternatives: Vec<&ArchetypeKey> =
                    trees.keys().filter(|key| **key != priority_path).collect();
                if !alternatives.is_empty() {
                    priority_path =
                        alternatives[switch_rng.random_range(0..alternatives.len())].clone();
                    debug!(tier, path = %priority_path, "priority path switched");
                }
            }
        }
        if node.children.is_empty() {
            break;
        }
        index = node.children[rng.random_range(0..node.children.len())];
    }
    Some(WalkOutcome {
        purchased,
        points_spent,
        tier,
        priority_path,
    })
}

/// Operation families subject to throttling.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Upgrade,
    Alliance,
    Targeting,
    Command,
}

impl OpKind {
    pub const ALL: [OpKind; 4] = [
        OpKind::Upgrade,
        OpKind::Alliance,
        OpKind::Targeting,
        OpKind::Command,
    ];

    fn index(self) -> usize {
        self as usize
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            OpKind::Upgrade => "upgrade",
            OpKind::Alliance => "alliance",
            OpKind::Targeting => "targeting",
            OpKind::Command => "command",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Composite rate-limit identifier: operation family plus agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ThrottleKey {
    pub kind: OpKind,
    pub agent: AgentId,
}

/// Throttle tuning. Delay pairs are `(base, max)` per [`OpKind`], indexed in
/// [`OpKind::ALL`] order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Queue depth at which an operation's dynamic delay reaches its max.
    pub max_queue_depth: u32,
    /// Continuous denial beyond this grants the next check unconditionally.
    pub max_wait: Duration,
    pub delays: [(Duration, Duration); 4],
    /// Global cooldown starting value.
    pub global_start: Duration,
    pub global_min: Duration,
    pub global_max: Duration,
    /// Minimum spacing between global cooldown adjustments.
    pub global_adjust_interval: Duration,
    /// Step applied under sustained load or idleness.
    pub global_step: Duration,
    /// Drift toward the midpoint when load is moderate.
    pub global_drift: Duration,
    /// Entry count above which a check may trigger stale-entry cleanup.
    pub cleanup_len: usize,
    /// Idle age beyond which an entry is evicted.
    pub cleanup_age: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            max_queue_depth: 10,
            max_wait: Duration::from_millis(2000),
            delays: [
                (Duration::from_millis(100), Duration::from_millis(500)),
                (Duration::from_millis(150), Duration::from_millis(600)),
                (Duration::from_millis(200), Duration::from_millis(800)),
                (Duration::from_millis(250), Duration::from_millis(1000)),
            ],
            global_start: Duration::from_millis(50),
            global_min: Duration::from_millis(25),
            global_max: Duration::from_millis(100),
            global_adjust_interval: Duration::from_millis(50),
            global_step: Duration::from_millis(5),
            global_drift: Duration::from_millis(2),
            cleanup_len: 50,
            cleanup_age: Duration::from_secs(10),
        }
    }
}

impl ThrottleConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_queue_depth == 0 {
            return Err(EngineError::InvalidConfig("max_queue_depth must be >= 1"));
        }
        if self.max_wait.is_zero() {
            return Err(EngineError::InvalidConfig("max_wait must be non-zero"));
        }
        for (base, max) in &self.delays {
            if base > max {
                return Err(EngineError::InvalidConfig(
                    "throttle base delay exceeds max delay",
                ));
            }
        }
        if self.global_min > self.global_max {
            return Err(EngineError::InvalidConfig(
                "global_min must not exceed global_max",
            ));
        }
        if self.global_start < self.global_min || self.global_start > self.global_max {
            return Err(EngineError::InvalidConfig(
                "global_start must lie within [global_min, global_max]",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ThrottleEntry {
    // Milliseconds on the throttle clock; zero means "never".
    last_run_ms: AtomicU64,
    first_denied_ms: AtomicU64,
}

/// Load-adaptive per-key rate limiter with anti-starvation forced execution.
///
/// Safe to share across threads: steady-state checks take only the entry
/// map's read lock plus atomic loads, so callers never serialize on a
/// global mutex. Timestamps and counters are heuristics; relaxed atomic
/// ordering is sufficient throughout.
pub struct OperationThrottle {
    config: ThrottleConfig,
    epoch: Instant,
    entries: RwLock<HashMap<ThrottleKey, Arc<ThrottleEntry>>>,
    depths: [AtomicI64; 4],
    global_last_exec_ms: AtomicU64,
    global_delay_ms: AtomicU64,
    global_last_adjust_ms: AtomicU64,
}

impl OperationThrottle {
    #[must_use]
    pub fn new(config: ThrottleConfig) -> Self {
        let global_start = config.global_start.as_millis() as u64;
        Self {
            config,
            epoch: Instant::now(),
            entries: RwLock::new(HashMap::new()),
            depths: std::array::from_fn(|_| AtomicI64::new(0)),
            global_last_exec_ms: AtomicU64::new(0),
            global_delay_ms: AtomicU64::new(global_start),
            global_last_adjust_ms: AtomicU64::new(0),
        }
    }

    // Clock starts at one so zero stays the "never" sentinel.
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64 + 1
    }

    /// Checks whether the operation may run now. A grant records the
    /// execution; a denial is a normal "try again later" signal. A key
    /// denied continuously for longer than `max_wait` is granted regardless
    /// of every cooldown.
    pub fn can_execute(&self, kind: OpKind, agent: AgentId) -> bool {
        let now = self.now_ms();
        self.adapt_global(now);
        self.maybe_cleanup(now);
        let entry = self.entry(ThrottleKey { kind, agent });

        let first_denied = entry.first_denied_ms.load(Ordering::Relaxed);
        let max_wait = self.config.max_wait.as_millis() as u64;
        if first_denied != 0 && now.saturating_sub(first_denied) >= max_wait {
            self.record_execution(&entry, now);
            debug!(kind = %kind, "forced execution after continuous denial");
            return true;
        }

        let last_run = entry.last_run_ms.load(Ordering::Relaxed);
        if last_run != 0 && now.saturating_sub(last_run) < self.dynamic_delay_ms(kind) {
            self.mark_denied(&entry, now);
            return false;
        }

        let global_last = self.global_last_exec_ms.load(Ordering::Relaxed);
        if global_last != 0
            && now.saturating_sub(global_last) < self.global_delay_ms.load(Ordering::Relaxed)
        {
            self.mark_denied(&entry, now);
            return false;
        }

        self.record_execution(&entry, now);
        true
    }

    /// Callers bracket the async portion of throttled work with
    /// [`Self::enqueued`] / [`Self::completed`] so the dynamic delay can see
    /// the in-flight load.
    pub fn enqueued(&self, kind: OpKind) {
        self.depths[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn completed(&self, kind: OpKind) {
        let depth = &self.depths[kind.index()];
        let previous = depth.fetch_sub(1, Ordering::Relaxed);
        if previous <= 0 {
            // Unbalanced bookkeeping; pin at zero rather than drift negative.
            depth.store(0, Ordering::Relaxed);
        }
    }

    #[must_use]
    pub fn queue_depth(&self, kind: OpKind) -> u32 {
        self.depths[kind.index()].load(Ordering::Relaxed).max(0) as u32
    }

    /// Current adaptive global cooldown, exposed for observability.
    #[must_use]
    pub fn global_delay(&self) -> Duration {
        Duration::from_millis(self.global_delay_ms.load(Ordering::Relaxed))
    }

    /// Number of live per-key entries.
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Clears all throttle state, e.g. on world reload.
    pub fn reset(&self) {
        self.entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
        for depth in &self.depths {
            depth.store(0, Ordering::Relaxed);
        }
        self.global_last_exec_ms.store(0, Ordering::Relaxed);
        self.global_delay_ms
            .store(self.config.global_start.as_millis() as u64, Ordering::Relaxed);
        self.global_last_adjust_ms.store(0, Ordering::Relaxed);
    }

    fn entry(&self, key: ThrottleKey) -> Arc<ThrottleEntry> {
        {
            let entries = self
                .entries
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(entry) = entries.get(&key) {
                return Arc::clone(entry);
            }
        }
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(entries.entry(key).or_default())
    }

    fn record_execution(&self, entry: &ThrottleEntry, now: u64) {
        entry.last_run_ms.store(now, Ordering::Relaxed);
        entry.first_denied_ms.store(0, Ordering::Relaxed);
        self.global_last_exec_ms.store(now, Ordering::Relaxed);
    }

    fn mark_denied(&self, entry: &ThrottleEntry, now: u64) {
        // Only the first denial of a streak is recorded.
        let _ = entry.first_denied_ms.compare_exchange(
            0,
            now,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }

    fn dynamic_delay_ms(&self, kind: OpKind) -> u64 {
        let (base, max) = self.config.delays[kind.index()];
        let base_ms = base.as_millis() as u64;
        let max_ms = max.as_millis() as u64;
        let depth = self.queue_depth(kind);
        let factor = (f64::from(depth) / f64::from(self.config.max_queue_depth)).min(1.0);
        base_ms + ((max_ms - base_ms) as f64 * factor) as u64
    }

    fn adapt_global(&self, now: u64) {
        let interval = self.config.global_adjust_interval.as_millis() as u64;
        let last = self.global_last_adjust_ms.load(Ordering::Relaxed);
        if now.saturating_sub(last) < interval {
            return;
        }
        if self
            .global_last_adjust_ms
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        let load: i64 = OpKind::ALL
            .iter()
            .map(|kind| self.depths[kind.index()].load(Ordering::Relaxed).max(0))
            .sum();
        let min = self.config.global_min.as_millis() as u64;
        let max = self.config.global_max.as_millis() as u64;
        let step = self.config.global_step.as_millis() as u64;
        let drift = self.config.global_drift.as_millis() as u64;
        let current = self.global_delay_ms.load(Ordering::Relaxed);
        let threshold = i64::from(self.config.max_queue_depth) * 2;
        let adjusted = if load > threshold {
            current.saturating_add(step)
        } else if load == 0 {
            current.saturating_sub(step)
        } else {
            let midpoint = (min + max) / 2;
            if current > midpoint {
                current.saturating_sub(drift)
            } else if current < midpoint {
                current.saturating_add(drift)
            } else {
                current
            }
        };
        self.global_delay_ms
            .store(adjusted.clamp(min, max), Ordering::Relaxed);
    }

    fn maybe_cleanup(&self, now: u64) {
        {
            let entries = self
                .entries
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if entries.len() <= self.config.cleanup_len {
                return;
            }
        }
        let horizon = self.config.cleanup_age.as_millis() as u64;
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = entries.len();
        entries.retain(|_, entry| {
            let last_run = entry.last_run_ms.load(Ordering::Relaxed);
            let first_denied = entry.first_denied_ms.load(Ordering::Relaxed);
            now.saturating_sub(last_run.max(first_denied)) <= horizon
        });
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!(evicted, remaining = entries.len(), "stale throttle entries evicted");
        }
    }
}

impl fmt::Debug for OperationThrottle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationThrottle")
            .field("tracked_keys", &self.tracked_keys())
            .field("global_delay", &self.global_delay())
            .finish_non_exhaustive()
    }
}

/// Immutable snapshot of one agent's pending allocation work.
///
/// Requests never alias live progress: the engine clones the progress in,
/// the worker hands value results out, and only the simulation thread
/// writes anything back.
#[derive(Clone, Debug)]
pub struct AllocationRequest {
    pub agent: AgentId,
    pub identity_bits: u64,
    pub progress: AgentProgress,
    pub catalog: Arc<UpgradeCatalog>,
    pub enqueued_at: Instant,
}

/// Value result produced by a worker and applied on the simulation thread.
#[derive(Clone, Debug, PartialEq)]
pub struct AllocationResult {
    pub agent: AgentId,
    pub new_levels: HashMap<UpgradeKey, u16>,
    pub points_spent: u32,
}

/// Everything one batch flush produced.
#[derive(Debug)]
pub struct BatchOutcome {
    pub results: Vec<AllocationResult>,
    /// Agents whose calculation missed the deadline; they are simply not
    /// upgraded this cycle and re-queue on their next accrual check.
    pub dropped: Vec<AgentId>,
    pub batch_size: usize,
    pub calc_elapsed: Duration,
}

enum BatchCommand {
    Enqueue(AllocationRequest),
    Flush,
    Shutdown,
}

/// Time-boxed concurrent batch scheduler.
///
/// Pending requests are keyed by agent with last-write-wins semantics. The
/// background worker flushes one window after the first enqueue since the
/// previous flush, runs the calculate phase on its own rayon pool (per
/// batch the effective width is min(pool, batch size)), and posts the
/// outcome for the simulation thread to drain. Dropping the scheduler
/// shuts the worker down and discards queued work.
pub struct BatchScheduler {
    commands: Sender<BatchCommand>,
    results: Receiver<BatchOutcome>,
    worker: Option<JoinHandle<()>>,
}

impl BatchScheduler {
    pub fn new(window: Duration, budget: Duration) -> Result<Self, EngineError> {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("warchest-calc-{i}"))
            .build()
            .map_err(|err| EngineError::WorkerPool(err.to_string()))?;
        let (commands, command_rx) = mpsc::channel();
        let (result_tx, results) = mpsc::channel();
        let worker = std::thread::Builder::new()
            .name("warchest-batch".into())
            .spawn(move || run_batch_worker(&command_rx, &result_tx, &pool, window, budget))
            .map_err(|err| EngineError::WorkerPool(err.to_string()))?;
        Ok(Self {
            commands,
            results,
            worker: Some(worker),
        })
    }

    /// Queues (or supersedes) the pending request for an agent. Returns
    /// false once the scheduler has shut down.
    pub fn queue_for_upgrade(&self, request: AllocationRequest) -> bool {
        self.commands.send(BatchCommand::Enqueue(request)).is_ok()
    }

    /// Forces the pending batch to process without waiting out the window.
    pub fn flush(&self) {
        let _ = self.commands.send(BatchCommand::Flush);
    }

    /// Collects every completed batch outcome without blocking.
    #[must_use]
    pub fn drain(&self) -> Vec<BatchOutcome> {
        let mut outcomes = Vec::new();
        while let Ok(outcome) = self.results.try_recv() {
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Stops the worker and discards queued work. Idempotent.
    pub fn shutdown(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = self.commands.send(BatchCommand::Shutdown);
            if worker.join().is_err() {
                warn!("batch worker panicked during shutdown");
            }
        }
    }
}

impl Drop for BatchScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_batch_worker(
    commands: &Receiver<BatchCommand>,
    results: &Sender<BatchOutcome>,
    pool: &rayon::ThreadPool,
    window: Duration,
    budget: Duration,
) {
    let mut pending: HashMap<AgentId, AllocationRequest> = HashMap::new();
    let mut window_opened: Option<Instant> = None;
    loop {
        let command = match window_opened {
            None => match commands.recv() {
                Ok(command) => command,
                Err(_) => break,
            },
            Some(opened) => {
                let due = opened + window;
                let now = Instant::now();
                if now >= due {
                    process_batch(&mut pending, pool, budget, results);
                    window_opened = None;
                    continue;
                }
                match commands.recv_timeout(due - now) {
                    Ok(command) => command,
                    Err(RecvTimeoutError::Timeout) => {
                        process_batch(&mut pending, pool, budget, results);
                        window_opened = None;
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        };
        match command {
            BatchCommand::Enqueue(request) => {
                if window_opened.is_none() {
                    window_opened = Some(Instant::now());
                }
                pending.insert(request.agent, request);
            }
            BatchCommand::Flush => {
                process_batch(&mut pending, pool, budget, results);
                window_opened = None;
            }
            BatchCommand::Shutdown => break,
        }
    }
    if !pending.is_empty() {
        debug!(
            discarded = pending.len(),
            "batch worker shut down with queued work"
        );
    }
}

fn process_batch(
    pending: &mut HashMap<AgentId, AllocationRequest>,
    pool: &rayon::ThreadPool,
    budget: Duration,
    results: &Sender<BatchOutcome>,
) {
    if pending.is_empty() {
        return;
    }
    let batch: Vec<AllocationRequest> = pending.drain().map(|(_, request)| request).collect();
    let batch_size = batch.len();
    let start = Instant::now();
    // A tenth of the budget is reserved for the serial apply phase.
    let deadline = start + (budget - budget / 10);
    let computed: Vec<Result<AllocationResult, AgentId>> = pool.install(|| {
        batch
            .par_iter()
            .map(|request| {
                if Instant::now() >= deadline {
                    return Err(request.agent);
                }
                let mut rng = SmallRng::seed_from_u64(request.identity_bits);
                match allocate(&request.progress, &request.catalog, &mut rng, Some(deadline)) {
                    Some(outcome) => Ok(AllocationResult {
                        agent: request.agent,
                        new_levels: outcome.new_levels,
                        points_spent: outcome.points_spent,
                    }),
                    None => Err(request.agent),
                }
            })
            .collect()
    });
    let mut outcome = BatchOutcome {
        results: Vec::with_capacity(batch_size),
        dropped: Vec::new(),
        batch_size,
        calc_elapsed: start.elapsed(),
    };
    for item in computed {
        match item {
            Ok(result) => outcome.results.push(result),
            Err(agent) => outcome.dropped.push(agent),
        }
    }
    info!(
        batch = batch_size,
        completed = outcome.results.len(),
        dropped = outcome.dropped.len(),
        elapsed_ms = outcome.calc_elapsed.as_millis() as u64,
        "batch calculate phase finished"
    );
    if results.send(outcome).is_err() {
        debug!("batch outcome receiver dropped");
    }
}

/// Read-only view of simulated time, owned outside the engine.
pub trait WorldClock {
    /// Elapsed whole simulated days.
    fn day(&self) -> u32;
    /// Monotonic step counter.
    fn step(&self) -> Tick;
}

/// Clock that advances one day every fixed number of steps.
#[derive(Clone, Copy, Debug)]
pub struct FixedStepClock {
    steps_per_day: u64,
    current: Tick,
}

impl FixedStepClock {
    #[must_use]
    pub fn new(steps_per_day: u64) -> Self {
        Self {
            steps_per_day: steps_per_day.max(1),
            current: Tick(0),
        }
    }

    pub fn advance(&mut self) {
        self.current.0 += 1;
    }
}

impl WorldClock for FixedStepClock {
    fn day(&self) -> u32 {
        (self.current.0 / self.steps_per_day) as u32
    }

    fn step(&self) -> Tick {
        self.current
    }
}

/// Synchronous key-value persistence for agent progress, keyed by the
/// agent's stable identity bits. Implementations swallow and log their own
/// I/O failures; a load miss and a failed load look the same to the engine.
pub trait ProgressStore: Send {
    fn load(&mut self, identity: u64) -> Option<AgentProgress>;
    fn save(&mut self, identity: u64, progress: &AgentProgress);
}

/// Store that remembers nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullStore;

impl ProgressStore for NullStore {
    fn load(&mut self, _identity: u64) -> Option<AgentProgress> {
        None
    }

    fn save(&mut self, _identity: u64, _progress: &AgentProgress) {}
}

/// Applies a resolved upgrade's effect to a live agent. Invoked only from
/// the apply phase on the simulation thread.
pub trait EffectApplier: Send {
    fn apply(&mut self, agent: AgentId, upgrade: &UpgradeDef, level: u16);
}

/// Applier that does nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullApplier;

impl EffectApplier for NullApplier {
    fn apply(&mut self, _agent: AgentId, _upgrade: &UpgradeDef, _level: u16) {}
}

/// How the engine turns budget into levels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStrategy {
    /// Randomized buy/save spend loop ([`allocate`]).
    #[default]
    Randomized,
    /// Seeded archetype-tree walk ([`walk_tree`]), reproducible from the
    /// world seed and agent identity. Always runs synchronously.
    Deterministic,
}

/// Engine tuning knobs. Validated once at construction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Seed for the engine rng and the walker's world seed. Random when
    /// unset; the resolved value is logged so runs can be reproduced.
    pub rng_seed: Option<u64>,
    /// Delay between the first queued request and the batch flush.
    pub batch_window: Duration,
    /// Wall-clock budget for one batch; a tenth is reserved for the apply
    /// phase and calculations past the remainder are dropped.
    pub processing_budget: Duration,
    /// Population at or above which allocation goes through the batch
    /// scheduler instead of running synchronously.
    pub batch_population_threshold: usize,
    pub strategy: AllocationStrategy,
    /// Step summaries retained for inspection; zero disables history.
    pub history_capacity: usize,
    pub throttle: ThrottleConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rng_seed: None,
            batch_window: Duration::from_millis(5000),
            processing_budget: Duration::from_millis(5000),
            batch_population_threshold: 32,
            strategy: AllocationStrategy::Randomized,
            history_capacity: 256,
            throttle: ThrottleConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.batch_window.is_zero() {
            return Err(EngineError::InvalidConfig("batch_window must be non-zero"));
        }
        if self.batch_population_threshold == 0 {
            return Err(EngineError::InvalidConfig(
                "batch_population_threshold must be >= 1",
            ));
        }
        self.throttle.validate()
    }
}

/// Identity and species of a live agent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentInfo {
    /// Stable 64-bit identity, independent of the arena handle. Seeds the
    /// batch allocation rng and the deterministic walker.
    pub identity_bits: u64,
    pub species: SpeciesKey,
    /// Default walker entry tree until a walk switches the priority path.
    pub archetype: Option<ArchetypeKey>,
}

/// Per-step progression statistics.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StepSummary {
    pub tick: Tick,
    pub day: u32,
    pub agent_count: usize,
    /// Agents whose accrual gained points this step.
    pub accrued: usize,
    /// Allocations applied synchronously this step.
    pub sync_applied: usize,
    /// Requests handed to the batch scheduler this step.
    pub enqueued: usize,
    /// Batch results applied this step.
    pub batch_applied: usize,
    /// Batch calculations dropped at the deadline this step.
    pub batch_dropped: usize,
    /// Upgrade checks denied by the throttle this step.
    pub throttled: usize,
}

/// Owns every piece of progression state and advances it one step at a time
/// on the caller's thread.
///
/// Each step runs accrual, allocation, and batch apply in that order. Live
/// state is mutated only here: batch workers receive cloned snapshots and
/// post value results back, and the store and effect applier are invoked
/// from the apply phase once the mutable borrows have ended.
pub struct ProgressionEngine {
    config: EngineConfig,
    world_seed: u64,
    rng: SmallRng,
    catalogs: CatalogLibrary,
    trees: TreeSet,
    agents: SlotMap<AgentId, AgentInfo>,
    progress: AgentMap<AgentProgress>,
    throttle: OperationThrottle,
    scheduler: Option<BatchScheduler>,
    in_flight: HashSet<AgentId>,
    store: Box<dyn ProgressStore>,
    applier: Box<dyn EffectApplier>,
    history: VecDeque<StepSummary>,
}

impl ProgressionEngine {
    /// Engine with no persistence and no effect hookup.
    pub fn new(
        config: EngineConfig,
        catalogs: CatalogLibrary,
        trees: TreeSet,
    ) -> Result<Self, EngineError> {
        Self::with_collaborators(
            config,
            catalogs,
            trees,
            Box::new(NullStore),
            Box::new(NullApplier),
        )
    }

    pub fn with_collaborators(
        config: EngineConfig,
        catalogs: CatalogLibrary,
        trees: TreeSet,
        store: Box<dyn ProgressStore>,
        applier: Box<dyn EffectApplier>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let world_seed = config.rng_seed.unwrap_or_else(rand::random);
        info!(world_seed, strategy = ?config.strategy, "progression engine ready");
        let scheduler = match config.strategy {
            AllocationStrategy::Randomized => Some(BatchScheduler::new(
                config.batch_window,
                config.processing_budget,
            )?),
            AllocationStrategy::Deterministic => None,
        };
        let throttle = OperationThrottle::new(config.throttle.clone());
        Ok(Self {
            world_seed,
            rng: SmallRng::seed_from_u64(world_seed),
            catalogs,
            trees,
            agents: SlotMap::with_key(),
            progress: AgentMap::new(),
            throttle,
            scheduler,
            in_flight: HashSet::new(),
            store,
            applier,
            history: VecDeque::new(),
            config,
        })
    }

    /// Registers an agent, drawing identity bits from the engine rng.
    pub fn spawn_agent(
        &mut self,
        species: SpeciesKey,
        archetype: Option<ArchetypeKey>,
    ) -> AgentId {
        let identity_bits = self.rng.next_u64();
        self.spawn_agent_with_identity(AgentInfo {
            identity_bits,
            species,
            archetype,
        })
    }

    /// Registers an agent keyed by caller-owned identity bits, e.g. a folded
    /// entity UUID. Progress persisted under those bits is loaded on the
    /// agent's first accrual check.
    pub fn spawn_agent_with_identity(&mut self, info: AgentInfo) -> AgentId {
        self.agents.insert(info)
    }

    /// Forgets an agent and its progress. A batch result still in flight for
    /// it is discarded when it arrives.
    pub fn remove_agent(&mut self, agent: AgentId) -> Option<AgentInfo> {
        self.progress.remove(agent);
        self.agents.remove(agent)
    }

    /// Credits one kill at the species' configured rate. Agents of species
    /// without a catalog earn nothing.
    pub fn record_kill(&mut self, agent: AgentId) {
        let Some(info) = self.agents.get(agent) else {
            return;
        };
        let identity = info.identity_bits;
        let species = info.species.clone();
        let Some(catalog) = self.catalogs.get(&species).cloned() else {
            return;
        };
        self.ensure_progress(agent, identity, &species);
        if let Some(progress) = self.progress.get_mut(agent) {
            progress.record_kill(catalog.kill_points);
        }
    }

    /// Advances progression by one step against the caller's clock.
    pub fn step(&mut self, clock: &dyn WorldClock) -> StepSummary {
        let mut summary = StepSummary {
            tick: clock.step(),
            day: clock.day(),
            agent_count: self.agents.len(),
            ..StepSummary::default()
        };
        let eligible = self.stage_accrue(summary.day, summary.tick, &mut summary);
        self.stage_allocate(&eligible, summary.tick, &mut summary);
        self.stage_apply_batches(summary.tick, &mut summary);
        self.push_history(summary.clone());
        summary
    }

    /// Forces the pending batch window to process without waiting it out.
    pub fn flush_batches(&self) {
        if let Some(scheduler) = &self.scheduler {
            scheduler.flush();
        }
    }

    /// Stops the batch worker. Queued calculations are discarded and later
    /// steps allocate synchronously. Idempotent.
    pub fn shutdown(&mut self) {
        if let Some(mut scheduler) = self.scheduler.take() {
            scheduler.shutdown();
        }
        for _agent in self.in_flight.drain() {
            self.throttle.completed(OpKind::Upgrade);
        }
    }

    /// Clears throttle state, e.g. when a world reloads.
    pub fn reset_throttle(&self) {
        self.throttle.reset();
    }

    #[must_use]
    pub fn world_seed(&self) -> u64 {
        self.world_seed
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    #[must_use]
    pub fn agent(&self, agent: AgentId) -> Option<&AgentInfo> {
        self.agents.get(agent)
    }

    pub fn agents(&self) -> impl Iterator<Item = (AgentId, &AgentInfo)> {
        self.agents.iter()
    }

    #[must_use]
    pub fn progress(&self, agent: AgentId) -> Option<&AgentProgress> {
        self.progress.get(agent)
    }

    #[must_use]
    pub fn throttle(&self) -> &OperationThrottle {
        &self.throttle
    }

    #[must_use]
    pub fn catalogs(&self) -> &CatalogLibrary {
        &self.catalogs
    }

    #[must_use]
    pub fn trees(&self) -> &TreeSet {
        &self.trees
    }

    /// Agents with a batch calculation outstanding.
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn history(&self) -> impl Iterator<Item = &StepSummary> {
        self.history.iter()
    }

    /// Brings day accrual current for every agent whose species has a
    /// catalog and whose upgrade check clears the throttle. Returns the
    /// agents that go on to allocation.
    fn stage_accrue(&mut self, day: u32, tick: Tick, summary: &mut StepSummary) -> Vec<AgentId> {
        let handles: Vec<AgentId> = self.agents.keys().collect();
        let mut eligible = Vec::with_capacity(handles.len());
        for agent in handles {
            let Some(info) = self.agents.get(agent) else {
                continue;
            };
            let identity = info.identity_bits;
            let species = info.species.clone();
            let Some(catalog) = self.catalogs.get(&species).cloned() else {
                continue;
            };
            if !self.throttle.can_execute(OpKind::Upgrade, agent) {
                summary.throttled += 1;
                continue;
            }
            self.ensure_progress(agent, identity, &species);
            let Some(progress) = self.progress.get_mut(agent) else {
                continue;
            };
            if progress.accrue_through_day(day, &catalog.daily_rates, tick) > 0.0 {
                summary.accrued += 1;
            }
            eligible.push(agent);
        }
        eligible
    }

    fn ensure_progress(&mut self, agent: AgentId, identity: u64, species: &SpeciesKey) {
        if self.progress.contains_key(agent) {
            return;
        }
        let record = self
            .store
            .load(identity)
            .unwrap_or_else(|| AgentProgress::new(species.clone()));
        self.progress.insert(agent, record);
    }

    fn stage_allocate(&mut self, eligible: &[AgentId], tick: Tick, summary: &mut StepSummary) {
        let batched = self.scheduler.is_some()
            && self.agents.len() >= self.config.batch_population_threshold;
        for &agent in eligible {
            let Some(info) = self.agents.get(agent) else {
                continue;
            };
            let identity = info.identity_bits;
            let archetype = info.archetype.clone();
            let species = info.species.clone();
            let Some(catalog) = self.catalogs.get(&species).cloned() else {
                continue;
            };
            match self.config.strategy {
                AllocationStrategy::Deterministic => {
                    if self.walk_and_apply(agent, identity, archetype.as_ref(), &catalog, tick) {
                        summary.sync_applied += 1;
                    }
                }
                AllocationStrategy::Randomized if batched => {
                    if self.enqueue_allocation(agent, identity, &catalog) {
                        summary.enqueued += 1;
                    }
                }
                AllocationStrategy::Randomized => {
                    if self.allocate_and_apply(agent, &catalog, tick) {
                        summary.sync_applied += 1;
                    }
                }
            }
        }
    }

    /// Synchronous spend loop for small populations, driven by the engine rng.
    fn allocate_and_apply(
        &mut self,
        agent: AgentId,
        catalog: &Arc<UpgradeCatalog>,
        tick: Tick,
    ) -> bool {
        let Some(progress) = self.progress.get(agent) else {
            return false;
        };
        let Some(outcome) = allocate(progress, catalog, &mut self.rng, None) else {
            return false;
        };
        if outcome.points_spent > 0 || outcome.stop == StopReason::Saved {
            debug!(
                ?agent,
                spent = outcome.points_spent,
                stop = ?outcome.stop,
                "allocation pass stopped"
            );
        }
        self.apply_allocation(agent, catalog, outcome.new_levels, outcome.points_spent, tick)
    }

    /// Snapshots the agent into the batch scheduler. At most one request per
    /// agent is outstanding, and a zero budget skips the queue entirely.
    fn enqueue_allocation(
        &mut self,
        agent: AgentId,
        identity: u64,
        catalog: &Arc<UpgradeCatalog>,
    ) -> bool {
        let Some(scheduler) = &self.scheduler else {
            return false;
        };
        if self.in_flight.contains(&agent) {
            return false;
        }
        let Some(progress) = self.progress.get(agent) else {
            return false;
        };
        if progress.budget() == 0 {
            return false;
        }
        let accepted = scheduler.queue_for_upgrade(AllocationRequest {
            agent,
            identity_bits: identity,
            progress: progress.clone(),
            catalog: Arc::clone(catalog),
            enqueued_at: Instant::now(),
        });
        if accepted && self.in_flight.insert(agent) {
            self.throttle.enqueued(OpKind::Upgrade);
        }
        accepted
    }

    /// Walks the agent's archetype tree and applies the outcome. The walk
    /// starts from the stored priority path, falling back to the spawn
    /// archetype.
    fn walk_and_apply(
        &mut self,
        agent: AgentId,
        identity: u64,
        archetype: Option<&ArchetypeKey>,
        catalog: &Arc<UpgradeCatalog>,
        tick: Tick,
    ) -> bool {
        let Some(progress) = self.progress.get(agent) else {
            return false;
        };
        let Some(start) = progress.priority_path().or(archetype).cloned() else {
            return false;
        };
        let total = progress.total_points();
        let Some(walk) = walk_tree(&self.trees, &start, self.world_seed, identity, total) else {
            return false;
        };
        self.apply_walk(agent, catalog, walk, tick)
    }

    /// Writes one walk outcome into live state. Purchase counts become
    /// absolute levels, clamped to the catalog and never lowered; cumulative
    /// walk spend advances the spent figure monotonically, so a smaller
    /// figure after a path switch is absorbed.
    fn apply_walk(
        &mut self,
        agent: AgentId,
        catalog: &Arc<UpgradeCatalog>,
        walk: WalkOutcome,
        tick: Tick,
    ) -> bool {
        let mut counts: HashMap<UpgradeKey, u16> = HashMap::new();
        for key in &walk.purchased {
            *counts.entry(key.clone()).or_insert(0) += 1;
        }
        let Some(progress) = self.progress.get_mut(agent) else {
            return false;
        };
        let mut changed: Vec<(UpgradeKey, u16)> = Vec::new();
        for (key, count) in counts {
            let Some(def) = catalog.get(&key) else {
                debug!(upgrade = %key, "tree purchase missing from the species catalog; skipped");
                continue;
            };
            let next = count.min(def.max_level()).max(progress.level(&key));
            if next != progress.level(&key) {
                progress.set_level(key.clone(), next);
                changed.push((key, next));
            }
        }
        let mut mutated = !changed.is_empty();
        let target = f64::from(walk.points_spent);
        if target > progress.spent_points() {
            mutated |= progress.add_spent(target - progress.spent_points()) > 0.0;
        }
        if walk.tier > progress.tier() {
            progress.raise_tier(walk.tier);
            mutated = true;
        }
        if progress.priority_path() != Some(&walk.priority_path) {
            progress.set_priority_path(walk.priority_path);
            mutated = true;
        }
        progress.mark_evaluated(tick);
        for (key, level) in &changed {
            if let Some(def) = catalog.get(key) {
                self.applier.apply(agent, def, *level);
            }
        }
        if mutated {
            self.persist(agent);
        }
        mutated
    }

    /// Drains completed batch outcomes and applies them. Results for
    /// despawned agents are discarded.
    fn stage_apply_batches(&mut self, tick: Tick, summary: &mut StepSummary) {
        let outcomes = match &self.scheduler {
            Some(scheduler) => scheduler.drain(),
            None => return,
        };
        for outcome in outcomes {
            summary.batch_dropped += outcome.dropped.len();
            for agent in outcome.dropped {
                self.settle_in_flight(agent);
            }
            for result in outcome.results {
                self.settle_in_flight(result.agent);
                let Some(info) = self.agents.get(result.agent) else {
                    continue;
                };
                let species = info.species.clone();
                let Some(catalog) = self.catalogs.get(&species).cloned() else {
                    continue;
                };
                if self.apply_allocation(
                    result.agent,
                    &catalog,
                    result.new_levels,
                    result.points_spent,
                    tick,
                ) {
                    summary.batch_applied += 1;
                }
            }
        }
    }

    fn settle_in_flight(&mut self, agent: AgentId) {
        if self.in_flight.remove(&agent) {
            self.throttle.completed(OpKind::Upgrade);
        }
    }

    /// Writes one allocation result into live state. Levels clamp to the
    /// catalog and never regress; spend advances by the result's figure.
    /// Changed levels reach the effect applier and the store.
    fn apply_allocation(
        &mut self,
        agent: AgentId,
        catalog: &Arc<UpgradeCatalog>,
        new_levels: HashMap<UpgradeKey, u16>,
        points_spent: u32,
        tick: Tick,
    ) -> bool {
        let Some(progress) = self.progress.get_mut(agent) else {
            return false;
        };
        let mut changed: Vec<(UpgradeKey, u16)> = Vec::with_capacity(new_levels.len());
        for (key, level) in new_levels {
            let Some(def) = catalog.get(&key) else {
                debug!(upgrade = %key, "allocation result names an unknown upgrade; skipped");
                continue;
            };
            let next = level.min(def.max_level()).max(progress.level(&key));
            if next != progress.level(&key) {
                progress.set_level(key.clone(), next);
                changed.push((key, next));
            }
        }
        let spent = if points_spent > 0 {
            progress.add_spent(f64::from(points_spent))
        } else {
            0.0
        };
        progress.mark_evaluated(tick);
        let mutated = spent > 0.0 || !changed.is_empty();
        for (key, level) in &changed {
            if let Some(def) = catalog.get(key) {
                self.applier.apply(agent, def, *level);
            }
        }
        if mutated {
            self.persist(agent);
        }
        mutated
    }

    fn persist(&mut self, agent: AgentId) {
        let Some(info) = self.agents.get(agent) else {
            return;
        };
        let identity = info.identity_bits;
        if let Some(progress) = self.progress.get(agent) {
            self.store.save(identity, progress);
        }
    }

    fn push_history(&mut self, summary: StepSummary) {
        if self.config.history_capacity == 0 {
            return;
        }
        if self.history.len() == self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(summary);
    }
}
