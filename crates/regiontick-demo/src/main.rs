use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use clap::Parser;
use regiontick_core::{
    ChunkPos, ContextId, EntityId, ModelSelection, RegiontickConfig, Target, ThreadingModel,
};
use regiontick_scheduler::sim::SimHost;
use regiontick_scheduler::{Scheduler, TaskSpec, TimeSpan};
use tracing::{info, warn};

/// Drive a simulated host through the scheduler and report what ran where.
#[derive(Parser, Debug)]
#[command(name = "regiontick-demo")]
#[command(version)]
struct Cli {
    /// TOML config file (REGIONTICK_* env vars override it).
    #[arg(long)]
    config: Option<String>,

    /// Threading model the simulated host runs.
    #[arg(long, default_value = "regionized")]
    host: ThreadingModel,

    /// Force the scheduler's model instead of probing the host.
    #[arg(long)]
    model: Option<ModelSelection>,

    #[arg(long, default_value_t = 100)]
    ticks: u64,

    #[arg(long, default_value_t = 4)]
    regions: u32,

    #[arg(long, default_value_t = 8)]
    entities: usize,

    /// Sleep one tick length between ticks instead of running flat out.
    #[arg(long)]
    realtime: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "regiontick_scheduler=info,regiontick_demo=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = RegiontickConfig::load(cli.config.as_deref())?;
    let regions = cli.regions.max(1);

    let host = Arc::new(match cli.host {
        ThreadingModel::SingleLoop => SimHost::single_loop(),
        ThreadingModel::Regionized => SimHost::regionized(),
    });
    let region_ids: Vec<ContextId> = (1..=regions).map(|r| host.add_region(r)).collect();

    let (errors_tx, mut errors_rx) = tokio::sync::mpsc::channel(64);
    let mut builder = Scheduler::builder(host.clone())
        .config(config.clone())
        .callback_errors(errors_tx);
    if let Some(model) = cli.model {
        builder = builder.threading_model(model);
    }
    let scheduler = builder.build()?;
    info!(host = %cli.host, model = %scheduler.model(), regions, "demo starting");

    tokio::spawn(async move {
        while let Some(err) = errors_rx.recv().await {
            warn!(task_id = %err.task, "callback error observed: {}", err.message);
        }
    });

    // half the entities start placed, the rest arrive at tick 10
    let entities: Vec<EntityId> = (0..cli.entities).map(|_| host.spawn_entity()).collect();
    for (i, e) in entities.iter().enumerate().filter(|(i, _)| i % 2 == 0) {
        host.place_entity(*e, region_ids[i % region_ids.len()]);
    }

    let fired = Arc::new(AtomicU64::new(0));
    for (i, e) in entities.iter().enumerate() {
        let fired = fired.clone();
        scheduler.submit(
            TaskSpec::new(Target::entity(*e))
                .label(format!("entity-{i}"))
                .delay(TimeSpan::ticks(1))
                .period(TimeSpan::ticks(5))
                .run(move |_| {
                    fired.fetch_add(1, Ordering::Relaxed);
                })
                .on_retired(move || info!(entity = i, "entity left the world; task retired")),
        )?;
    }

    let world = host.add_world("overworld");
    host.load_chunk(&world, ChunkPos::from_block(0, 0), region_ids[0]);
    let spawn_chunk = Target::at_block("overworld", 8, 8);
    scheduler.run_timer(spawn_chunk, TimeSpan::ticks(0), TimeSpan::ticks(20), |me| {
        info!(runs = me.run_count() + 1, "spawn chunk maintenance");
    })?;
    scheduler.run_timer(Target::Global, TimeSpan::ticks(0), TimeSpan::ticks(25), |_| {
        info!("global heartbeat");
    })?;
    scheduler.run_later(Target::Global, TimeSpan::ticks(40), |_| {
        panic!("deliberate failure to exercise the error channel")
    })?;
    scheduler.run_timer(Target::Async, TimeSpan::millis(0), TimeSpan::millis(500), |me| {
        info!(runs = me.run_count() + 1, "off-loop housekeeping");
    })?;

    let mut pace = tokio::time::interval(scheduler.time().tick_duration());
    for tick in 1..=cli.ticks {
        if cli.realtime {
            pace.tick().await;
        }
        host.advance();

        match tick {
            10 => {
                for (i, e) in entities.iter().enumerate().filter(|(i, _)| i % 2 == 1) {
                    host.place_entity(*e, region_ids[i % region_ids.len()]);
                }
                info!(tick, "late entities placed");
            }
            30 if region_ids.len() > 1 => {
                if let Some(e) = entities.first() {
                    host.place_entity(*e, region_ids[1]);
                    info!(tick, "entity-0 migrated");
                }
            }
            50 => {
                if let Some(e) = entities.last() {
                    host.despawn_entity(*e);
                }
            }
            60 if region_ids.len() > 1 => {
                let gone = region_ids[region_ids.len() - 1];
                host.remove_region(gone);
                scheduler.context_retired(gone);
                for (i, e) in entities.iter().enumerate() {
                    if i % region_ids.len() == region_ids.len() - 1 && i + 1 != entities.len() {
                        host.place_entity(*e, region_ids[0]);
                    }
                }
                info!(tick, context = %gone, "region dissolved");
            }
            _ => {}
        }
        scheduler.poll_retries();
    }

    info!(
        ticks = cli.ticks,
        entity_runs = fired.load(Ordering::Relaxed),
        pending = scheduler.pending_tasks(),
        "demo finished"
    );
    scheduler.shutdown();
    Ok(())
}
