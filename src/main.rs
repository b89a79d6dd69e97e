use std::{env, path::PathBuf, process, sync::Arc};

use anyhow::{bail, Context, Result};

use verdant::analyzer::{
    AnalysisResult, AnalyzerController, AnalyzerEvent, DeviceImageSource, GeminiClassifier,
};
use verdant::{AuthService, Database, SettingsStore};

const DEMO_NAME: &str = "Test User";
const DEMO_EMAIL: &str = "user";
const DEMO_PASSWORD: &str = "password123";

#[tokio::main]
async fn main() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    if let Err(err) = run().await {
        eprintln!("error: {err:#}");
        process::exit(1);
    }
}

async fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();

    let data_dir = data_dir()?;
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create {}", data_dir.display()))?;

    let settings = SettingsStore::new(data_dir.join("settings.json"))?;
    let database = Database::new(data_dir.join("verdant.sqlite3"))?;
    let auth = Arc::new(AuthService::new(database.clone()));

    // Demo account so the harness works out of the box.
    let user = match auth.login(DEMO_EMAIL, DEMO_PASSWORD).await {
        Ok(user) => user,
        Err(_) => auth.register(DEMO_NAME, DEMO_EMAIL, DEMO_PASSWORD).await?,
    };
    println!("Signed in as {} <{}>", user.name, user.email);

    let history = database.get_events_for_user(&user.id).await?;
    if !history.is_empty() {
        println!("Previous analyses:");
        for event in &history {
            println!(
                "  {}  {}",
                event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                event.result.issue_name
            );
        }
    }

    let classifier_settings = settings.classifier();
    if classifier_settings.api_key.is_empty() {
        log::warn!("GEMINI_API_KEY is not set; classification requests will fail");
    }

    let live_settings = settings.live_feed();
    let controller = AnalyzerController::new(
        Arc::new(DeviceImageSource::new(&live_settings)?),
        Arc::new(GeminiClassifier::new(classifier_settings)?),
        Arc::clone(&auth) as Arc<dyn verdant::analyzer::AuthGate>,
        Arc::new(database.clone()),
        live_settings,
    );

    match args.first().map(String::as_str) {
        Some("upload") => {
            let path = args.get(1).context("usage: verdant upload <image-path>")?;
            run_upload(&controller, PathBuf::from(path)).await
        }
        Some("live") => {
            let cycles = args
                .get(1)
                .map(|raw| raw.parse::<usize>())
                .transpose()
                .context("cycle count must be a number")?
                .unwrap_or(3);
            run_live(&controller, cycles).await
        }
        _ => bail!("usage: verdant upload <image-path> | verdant live [cycles]"),
    }
}

async fn run_upload(controller: &AnalyzerController, path: PathBuf) -> Result<()> {
    let mut events = controller.subscribe();
    controller.start_upload(&path).await?;

    loop {
        match events.recv().await? {
            AnalyzerEvent::AnalysisCompleted { event } => {
                print_diagnosis(&event.result);
                return Ok(());
            }
            AnalyzerEvent::StateChanged { state } => {
                if let Some(error) = state.current_error {
                    bail!("{error}");
                }
            }
        }
    }
}

async fn run_live(controller: &AnalyzerController, cycles: usize) -> Result<()> {
    let mut events = controller.subscribe();
    controller.start_live().await?;
    println!("Connecting to device feed...");

    let mut completed = 0;
    while completed < cycles {
        match events.recv().await? {
            AnalyzerEvent::AnalysisCompleted { event } => {
                completed += 1;
                println!("--- cycle {completed} ---");
                print_diagnosis(&event.result);
            }
            AnalyzerEvent::StateChanged { state } => {
                if let Some(sample) = state.latest_sample {
                    log::info!(
                        "sensor sample: {:.1}C, {}% humidity, {} lux",
                        sample.temperature,
                        sample.humidity,
                        sample.light
                    );
                }
                if let Some(error) = state.current_error {
                    log::warn!("cycle failed: {error}");
                }
            }
        }
    }

    controller.stop().await?;
    Ok(())
}

fn print_diagnosis(result: &AnalysisResult) {
    let status = if result.is_healthy {
        "healthy"
    } else {
        "needs attention"
    };
    println!("{} ({status})", result.issue_name);
    println!("{}", result.description);
    for recommendation in &result.recommendations {
        println!("  - {recommendation}");
    }
}

fn data_dir() -> Result<PathBuf> {
    let base = dirs::data_dir().context("could not determine a data directory")?;
    Ok(base.join("verdant"))
}
