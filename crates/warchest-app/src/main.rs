use anyhow::{Context, Result};
use rand::{Rng, SeedableRng, rngs::SmallRng};
use std::time::Duration;
use tracing::{debug, info};
use warchest_core::{
    AgentId, AllocationStrategy, ArchetypeKey, CatalogLibrary, EffectApplier, EngineConfig,
    FixedStepClock, ProgressionEngine, SpeciesKey, TreeSet, UpgradeDef,
};
use warchest_storage::ProgressPipeline;

const CATALOG_DOC: &str = r#"[
  {
    "species": "ravager",
    "save_chance": 0.15,
    "kill_points": 1.0,
    "daily_rates": [
      { "from": 1, "to": 10, "rate": 0.1 },
      { "from": 11, "to": 15, "rate": 0.5 },
      { "from": 16, "to": 20, "rate": 1.0 },
      { "from": 21, "to": 25, "rate": 1.5 },
      { "from": 26, "to": 30, "rate": 3.0 },
      { "from": 31, "rate": 5.0 }
    ],
    "upgrades": [
      { "key": "health_boost", "costs": [1, 2, 3], "effect": { "kind": "stat_boost", "stat": "health", "per_level": 2.0 } },
      { "key": "sharp_claws", "costs": [2, 4], "effect": { "kind": "stat_boost", "stat": "damage", "per_level": 1.5 } },
      { "key": "war_banner", "costs": [5], "effect": { "kind": "timed_buff", "stat": "speed", "seconds": 30 } },
      { "key": "stone_skin", "costs": [1, 2, 3], "effect": { "kind": "stat_boost", "stat": "resistance", "per_level": 1.0 } }
    ]
  },
  {
    "species": "stalker",
    "save_chance": 0.25,
    "kill_points": 1.5,
    "daily_rates": [
      { "from": 1, "to": 5, "rate": 0.2 },
      { "from": 6, "to": 20, "rate": 0.8 },
      { "from": 21, "rate": 2.0 }
    ],
    "upgrades": [
      { "key": "health_boost", "costs": [1, 2], "effect": { "kind": "stat_boost", "stat": "health", "per_level": 1.5 } },
      { "key": "shadow_step", "costs": [2, 3, 4], "effect": { "kind": "ability", "ability": "vanish", "chance_per_level": 0.04 } },
      { "key": "serrated_blades", "costs": [3, 5], "effect": { "kind": "stat_boost", "stat": "damage", "per_level": 2.0 } }
    ]
  },
  {
    "species": "colossus",
    "save_chance": 0.1,
    "kill_points": 0.75,
    "daily_rates": [
      { "from": 1, "to": 15, "rate": 0.05 },
      { "from": 16, "to": 30, "rate": 1.0 },
      { "from": 31, "rate": 4.0 }
    ],
    "upgrades": [
      { "key": "health_boost", "costs": [2, 3, 4], "effect": { "kind": "stat_boost", "stat": "health", "per_level": 3.0 } },
      { "key": "granite_plating", "costs": [1, 2, 3, 4], "effect": { "kind": "stat_boost", "stat": "resistance", "per_level": 2.0 } },
      { "key": "siege_gauntlets", "costs": [4], "effect": { "kind": "equipment_tier", "slot": "weapon" } },
      { "key": "crushing_stride", "costs": [3, 3], "effect": { "kind": "stat_boost", "stat": "speed", "per_level": 0.5 } }
    ]
  }
]"#;

const TREE_DOC: &str = r#"[
  {
    "archetype": "berserker",
    "nodes": [
      { "upgrade": "health_boost", "cost": 1, "children": [1, 2] },
      { "upgrade": "sharp_claws", "cost": 2, "tier_requirement": 1, "children": [3] },
      { "upgrade": "war_banner", "cost": 2, "tier_requirement": 1 },
      { "upgrade": "health_boost", "cost": 3, "tier_requirement": 2 }
    ]
  },
  {
    "archetype": "warden",
    "nodes": [
      { "upgrade": "health_boost", "cost": 2, "children": [1] },
      { "upgrade": "granite_plating", "cost": 3, "tier_requirement": 1, "children": [2] },
      { "upgrade": "granite_plating", "cost": 4, "tier_requirement": 2 }
    ]
  },
  {
    "archetype": "marauder",
    "nodes": [
      { "upgrade": "shadow_step", "cost": 1, "children": [1] },
      { "upgrade": "serrated_blades", "cost": 3, "tier_requirement": 1 }
    ]
  }
]"#;

fn main() -> Result<()> {
    init_tracing();
    run_simulation()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

struct LogApplier;

impl EffectApplier for LogApplier {
    fn apply(&mut self, agent: AgentId, upgrade: &UpgradeDef, level: u16) {
        debug!(?agent, upgrade = %upgrade.key, level, "Applied upgrade effect");
    }
}

fn run_simulation() -> Result<()> {
    let days: u32 = std::env::var("WARCHEST_DAYS")
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(30);
    let population: usize = std::env::var("WARCHEST_AGENTS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(120);
    let steps_per_day: u64 = std::env::var("WARCHEST_STEPS_PER_DAY")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(20);
    let seed: Option<u64> = std::env::var("WARCHEST_SEED")
        .ok()
        .and_then(|s| s.parse::<u64>().ok());
    let db_path =
        std::env::var("WARCHEST_DB").unwrap_or_else(|_| "warchest.duckdb".to_string());
    let strategy = match std::env::var("WARCHEST_STRATEGY").ok().as_deref() {
        Some("deterministic") => AllocationStrategy::Deterministic,
        _ => AllocationStrategy::Randomized,
    };

    let library = CatalogLibrary::load_json(CATALOG_DOC).context("parse bundled catalogs")?;
    let trees = TreeSet::load_json(TREE_DOC).context("parse bundled archetype trees")?;

    let pipeline = ProgressPipeline::open(&db_path)
        .with_context(|| format!("open progress database at {db_path}"))?;
    let db = pipeline.db();

    let config = EngineConfig {
        rng_seed: seed,
        batch_window: Duration::from_millis(25),
        processing_budget: Duration::from_millis(250),
        batch_population_threshold: 64,
        strategy,
        ..EngineConfig::default()
    };
    let mut engine = ProgressionEngine::with_collaborators(
        config,
        library,
        trees,
        Box::new(pipeline),
        Box::new(LogApplier),
    )?;

    let mut species: Vec<SpeciesKey> = engine.catalogs().species().cloned().collect();
    species.sort();
    let archetypes: Vec<ArchetypeKey> = engine.trees().keys().cloned().collect();
    let handles: Vec<AgentId> = (0..population)
        .map(|i| {
            engine.spawn_agent(
                species[i % species.len()].clone(),
                archetypes.get(i % archetypes.len().max(1)).cloned(),
            )
        })
        .collect();
    info!(
        days,
        population,
        steps_per_day,
        strategy = ?strategy,
        "Starting warchest progression run",
    );

    let mut kill_rng = SmallRng::seed_from_u64(engine.world_seed().rotate_left(17));
    let mut clock = FixedStepClock::new(steps_per_day);
    let mut last_day = 0u32;
    for _ in 0..u64::from(days) * steps_per_day {
        clock.advance();
        for &agent in &handles {
            if kill_rng.random_bool(0.05) {
                engine.record_kill(agent);
            }
        }
        let summary = engine.step(&clock);
        if summary.day != last_day {
            last_day = summary.day;
            info!(
                day = summary.day,
                accrued = summary.accrued,
                sync_applied = summary.sync_applied,
                enqueued = summary.enqueued,
                batch_applied = summary.batch_applied,
                throttled = summary.throttled,
                "Day boundary",
            );
        }
    }

    // Give the batch worker a window to finish, then collect stragglers.
    engine.flush_batches();
    std::thread::sleep(Duration::from_millis(400));
    clock.advance();
    let summary = engine.step(&clock);
    info!(
        tick = summary.tick.0,
        batch_applied = summary.batch_applied,
        batch_dropped = summary.batch_dropped,
        "Final apply pass"
    );
    engine.shutdown();
    drop(engine);

    let mut guard = db
        .lock()
        .map_err(|_| anyhow::anyhow!("progress database mutex poisoned"))?;
    guard.flush().context("final flush")?;
    for leader in guard.most_advanced(10).context("leaderboard query")? {
        info!(
            identity = leader.identity,
            species = %leader.species,
            spent = leader.spent_points,
            tier = leader.tier,
            "Leaderboard entry",
        );
    }
    for row in guard.species_totals().context("species totals query")? {
        info!(
            species = %row.species,
            agents = row.agents,
            spent = row.total_spent,
            earned = row.total_earned,
            "Species economy",
        );
    }
    Ok(())
}
