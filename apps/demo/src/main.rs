use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use clap::Parser;
use flow::{combine_latest, Flow, FlowEvent, FlowHooks, FlowOutcome};
use form_core::{FormController, StaticFieldsService};
use rand::Rng;
use shared::domain::FormField;
use tasks::{Task, TaskScheduler};
use tokio::time::sleep;
use tracing::{error, info};

#[derive(Parser, Debug)]
struct Args {
    /// Upper bound on tasks running at the same time.
    #[arg(long, default_value_t = 2)]
    max_concurrency: usize,
    /// Simulated latency of every fake backend call, in milliseconds.
    #[arg(long, default_value_t = 200)]
    latency_ms: u64,
}

#[derive(Debug, Clone)]
struct UserInfo {
    name: String,
    age: u32,
}

#[derive(Debug, Clone)]
struct VehicleInfo {
    brand: String,
    year: u32,
}

struct FetchUserInfoService {
    latency: Duration,
}

impl FetchUserInfoService {
    fn fetch(&self) -> Flow<UserInfo> {
        let latency = self.latency;
        Flow::once(async move {
            sleep(latency).await;
            Ok(UserInfo {
                name: "Maria".to_string(),
                age: rand::thread_rng().gen_range(18..90),
            })
        })
    }
}

struct FetchVehicleInfoService {
    latency: Duration,
}

impl FetchVehicleInfoService {
    fn fetch(&self) -> Flow<VehicleInfo> {
        let latency = self.latency;
        Flow::once(async move {
            sleep(latency).await;
            Ok(VehicleInfo {
                brand: "Volvo".to_string(),
                year: rand::thread_rng().gen_range(1990..2026),
            })
        })
    }
}

/// Wraps a flow with spinner-style side effects: shown on subscribe,
/// hidden on any terminal, failure logged.
struct IndicatorPresenter;

impl IndicatorPresenter {
    fn present<T: Send + 'static>(&self, label: &'static str, flow: Flow<T>) -> Flow<T> {
        flow.handle_events(
            FlowHooks::new()
                .on_subscribe(move || info!(label, "spinner shown"))
                .on_complete(move |outcome| {
                    if let FlowOutcome::Failed(failure) = outcome {
                        error!(label, %failure, "fetch failed");
                    }
                    info!(label, "spinner hidden");
                })
                .on_cancel(move || info!(label, "spinner hidden (cancelled)")),
        )
    }
}

fn random_number_task(latency: Duration) -> Arc<Task<u32>> {
    Task::new(move |handle| async move {
        sleep(latency).await;
        let number = rand::thread_rng().gen_range(0..1000);
        info!(task_id = %handle.id(), number, "random number ready");
        Ok(number)
    })
}

async fn task_composition(scheduler: &TaskScheduler, latency: Duration) {
    let combined = scheduler.combine_results(
        random_number_task(latency),
        random_number_task(latency * 2),
    );
    let (pairs, _) = combined.subscribe().collect().await;
    if let Some((a, b)) = pairs.last() {
        println!("combined results: {a:?} + {b:?}");
    }

    let mut merged = scheduler
        .merge_results(random_number_task(latency * 2), random_number_task(latency))
        .subscribe();
    while let Some(event) = merged.recv().await {
        if let FlowEvent::Value(result) = event {
            println!("merged result arrived: {result:?}");
        }
    }
}

async fn chained_flows() -> Result<()> {
    // Each stage feeds the next: a number, its successor as text, a
    // greeting built from that text.
    let chain = Flow::just(1)
        .flat_map(|n: i32| Flow::just((n + 1).to_string()))
        .flat_map(|text: String| Flow::just(format!("{text} Hi!")))
        .handle_events(FlowHooks::new().on_complete(|outcome| match outcome {
            FlowOutcome::Finished => info!("chain finished"),
            FlowOutcome::Failed(failure) => error!(%failure, "chain failed"),
        }));
    let (values, _) = chain.subscribe().collect().await;
    let greeting = values
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("chain produced no value"))?;
    println!("chained flows produced: {greeting}");
    Ok(())
}

async fn profile_with_indicator(latency: Duration) -> Result<()> {
    let users = FetchUserInfoService { latency };
    let vehicles = FetchVehicleInfoService {
        latency: latency * 2,
    };
    let presenter = IndicatorPresenter;

    let profile = presenter.present(
        "profile",
        combine_latest(users.fetch(), vehicles.fetch()),
    );
    let (profiles, outcome) = profile.subscribe().collect().await;
    match outcome {
        Some(FlowOutcome::Failed(error)) => Err(error),
        _ => {
            let (user, vehicle) = profiles
                .into_iter()
                .next_back()
                .ok_or_else(|| anyhow!("profile fetch produced no pair"))?;
            println!(
                "profile: {} ({}) drives a {} from {}",
                user.name, user.age, vehicle.brand, vehicle.year
            );
            Ok(())
        }
    }
}

async fn form_walkthrough() -> Result<()> {
    let first_name = FormField::new("First name");
    let last_name = FormField::new("Last name");
    let mut controller = FormController::new(StaticFieldsService::new(vec![
        first_name.clone(),
        last_name.clone(),
    ]));
    let mut rejected = controller.rejected_edits();
    controller.load().await?;
    println!(
        "form loaded with {} fields, valid: {}",
        controller.fields().borrow().len(),
        controller.is_form_valid()
    );

    controller.update_field_text(&first_name, "Maria");
    println!("after one edit, valid: {}", controller.is_form_valid());
    controller.update_field_text(&last_name, "Lindqvist");
    println!("after both edits, valid: {}", controller.is_form_valid());
    controller.update_field_text(&last_name, "");
    println!("after clearing a field, valid: {}", controller.is_form_valid());
    controller.update_field_text(&last_name, "Lindqvist");

    let stranger = FormField::new("Nickname");
    controller.update_field_text(&stranger, "Mia");
    let rejection = rejected.recv().await?;
    println!(
        "edit for unknown field {} was rejected, valid still: {}",
        rejection.field_id,
        controller.is_form_valid()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let args = Args::parse();
    let latency = Duration::from_millis(args.latency_ms);
    let scheduler = TaskScheduler::new(args.max_concurrency);

    println!("== task composition ==");
    task_composition(&scheduler, latency).await;

    println!("== chained flows ==");
    chained_flows().await?;

    println!("== profile fetch with loading indicator ==");
    profile_with_indicator(latency).await?;

    println!("== form controller ==");
    form_walkthrough().await?;

    Ok(())
}
