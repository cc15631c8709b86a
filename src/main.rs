//! 命令行入口：建库与检索

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser as _;
use faunafind::{
    init_tracing, predicted_class, AppResult, AppState, ConfigService, EmbeddingService,
    ExtractionMode,
};

#[derive(clap::Parser)]
#[command(name = "faunafind")]
#[command(about = "Reverse image search for animal photos")]
struct Args {
    /// Config file (defaults to the platform data dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Rebuild the feature store from a labeled corpus
    Build {
        /// Corpus root laid out as <class>/<image>
        #[arg(long)]
        corpus: Option<PathBuf>,

        #[arg(long)]
        max_per_class: Option<usize>,

        #[arg(long)]
        batch_size: Option<usize>,

        /// Skip randomized augmentation of corpus images
        #[arg(long)]
        no_augment: bool,
    },

    /// Find the most similar corpus images
    Search {
        image: PathBuf,

        #[arg(short = 'k', long)]
        top_k: Option<usize>,

        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the normalised embedding of one image
    Extract {
        image: PathBuf,

        /// Apply build-time augmentation
        #[arg(long)]
        augment: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "command failed");
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> AppResult<()> {
    let config_service = match args.config {
        Some(path) => ConfigService::with_path(path),
        None => ConfigService::new()?,
    };
    let mut config = config_service.load()?;
    tracing::debug!(config = %config_service.config_path().display(), "config loaded");

    match args.command {
        Command::Build {
            corpus,
            max_per_class,
            batch_size,
            no_augment,
        } => {
            if no_augment {
                config.build.augment = false;
            }
            let corpus = corpus.unwrap_or_else(|| config.corpus_root());
            let max_per_class = max_per_class.unwrap_or(config.build.max_per_class);
            let batch_size = batch_size.unwrap_or(config.build.batch_size);

            let state = AppState::new(config)?;
            let report = state.builder.build(&corpus, max_per_class, batch_size).await?;

            println!("Feature extraction completed:");
            println!("- Total images processed: {}", report.processed);
            println!("- Failed images: {}", report.failed);
            println!("- Time taken: {:.2} seconds", report.elapsed_ms as f64 / 1000.0);
            println!("- Throughput: {:.2} images/second", report.throughput());
            for (class, count) in &report.per_class {
                println!("  {class}: {count}");
            }
            println!("Store written to {}", report.store_path.display());
        }
        Command::Search { image, top_k, json } => {
            let top_k = top_k.unwrap_or(config.search.top_k);
            let state = AppState::new(config)?;
            let results = state.search.search(&image, top_k).await;
            let predicted = predicted_class(&results);

            if json {
                let payload = serde_json::json!({
                    "query_image": image,
                    "predicted_class": predicted,
                    "results": results,
                });
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else if results.is_empty() {
                println!("No similar images found");
            } else {
                if let Some(class) = predicted {
                    println!("Predicted class: {class}");
                }
                for (i, result) in results.iter().enumerate() {
                    println!("{}. Class: {}", i + 1, result.class_label);
                    println!("   Path: {}", result.identity);
                    println!("   Similarity Score: {:.4}", result.score);
                }
            }
        }
        Command::Extract { image, augment } => {
            config.build.augment = augment;
            let embedding = EmbeddingService::new(&config)?;
            let mode = if augment {
                ExtractionMode::Build
            } else {
                ExtractionMode::Query
            };
            let vector = embedding.extract_path(&image, mode).await?;
            println!("{}", serde_json::to_string(&vector)?);
        }
    }

    Ok(())
}
