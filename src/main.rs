use clap::{Parser, Subcommand};
use eyre::{Result, WrapErr};
use std::net::SocketAddr;
use std::path::PathBuf;

use xai_ids::batch::{format_summary, parse_csv, run_batch};
use xai_ids::detector::{Detector, DetectorConfig, DEFAULT_TOP_K};
use xai_ids::features::DEFAULT_EXPECTED_FEATURES;
use xai_ids::mailer::{SmtpSettings, DEFAULT_SMTP_PORT};

#[derive(Parser)]
#[command(
    name = "xai-ids",
    about = "Explainable network intrusion detection: tree-ensemble predictions with SHAP attributions."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP detection service
    Serve {
        /// Address to bind to (use 0.0.0.0:8000 to expose externally)
        #[arg(long, env = "XAI_IDS_BIND", default_value = "127.0.0.1:8000")]
        bind: String,

        /// Directory with label/feature files, users.json and metrics.json
        #[arg(long, env = "XAI_IDS_DATA_DIR", default_value = "data")]
        data_dir: PathBuf,

        /// Tree ensemble artifact (defaults to <data-dir>/model.json)
        #[arg(long, env = "MODEL_PATH")]
        model_path: Option<PathBuf>,

        /// Path for JSONL access log
        #[arg(long, env = "XAI_IDS_ACCESS_LOG", default_value = "xai-ids-access.jsonl")]
        access_log: PathBuf,

        /// Number of attributions returned per prediction
        #[arg(long, default_value_t = DEFAULT_TOP_K)]
        top_k: usize,

        #[arg(long, env = "SMTP_SERVER")]
        smtp_server: Option<String>,

        #[arg(long, env = "SMTP_PORT", default_value_t = DEFAULT_SMTP_PORT)]
        smtp_port: u16,

        #[arg(long, env = "SMTP_USER")]
        smtp_user: Option<String>,

        #[arg(long, env = "SMTP_PASSWORD", hide_env_values = true)]
        smtp_password: Option<String>,

        /// Frontend base URL used in verification links
        #[arg(long, env = "FRONTEND_URL", default_value = "http://localhost:3000")]
        frontend_url: String,

        /// Comma-separated origins allowed by CORS
        #[arg(
            long,
            env = "CORS_ORIGINS",
            value_delimiter = ',',
            default_value = "http://localhost:3000,http://127.0.0.1:3000"
        )]
        cors_origins: Vec<String>,
    },

    /// Score feature vectors locally without starting the server
    Predict {
        /// Comma-separated feature values
        #[arg(long, conflicts_with = "csv", required_unless_present = "csv")]
        features: Option<String>,

        /// CSV file with a header row, one flow per row
        #[arg(long)]
        csv: Option<PathBuf>,

        /// Tree ensemble artifact
        #[arg(long, env = "MODEL_PATH", default_value = "data/model.json")]
        model_path: PathBuf,

        /// Directory with label_mapping.json and feature_names.json
        #[arg(long, env = "XAI_IDS_DATA_DIR", default_value = "data")]
        data_dir: PathBuf,

        /// Output format: json or summary
        #[arg(long, default_value = "summary")]
        format: String,
    },
}

struct ServeArgs {
    bind: String,
    data_dir: PathBuf,
    model_path: Option<PathBuf>,
    access_log: PathBuf,
    top_k: usize,
    smtp: SmtpSettings,
    frontend_url: String,
    cors_origins: Vec<String>,
}

fn cmd_serve(args: ServeArgs) -> Result<()> {
    use xai_ids::server::{run_server, ServerConfig};

    let bind_addr: SocketAddr = args
        .bind
        .parse()
        .wrap_err_with(|| format!("Invalid bind address: {}", args.bind))?;

    let config = ServerConfig {
        bind_addr,
        data_dir: args.data_dir,
        model_path: args.model_path,
        top_k: args.top_k,
        access_log_path: args.access_log,
        smtp: args.smtp,
        frontend_url: args.frontend_url,
        cors_origins: args
            .cors_origins
            .into_iter()
            .map(|o| o.trim().to_string())
            .filter(|o| !o.is_empty())
            .collect(),
        ..Default::default()
    };

    eprintln!("Starting xai-ids detection service...");
    eprintln!("Data dir: {}", config.data_dir.display());
    eprintln!(
        "Model: {}",
        config.detector_config().model_path.display()
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_server(config))?;

    Ok(())
}

fn parse_feature_list(raw: &str) -> Result<Vec<f64>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<f64>()
                .wrap_err_with(|| format!("Invalid feature value: {:?}", s))
        })
        .collect()
}

fn cmd_predict(
    features: Option<String>,
    csv: Option<PathBuf>,
    model_path: PathBuf,
    data_dir: PathBuf,
    format: String,
) -> Result<i32> {
    let detector = Detector::load(&DetectorConfig {
        model_path,
        label_mapping_path: data_dir.join("label_mapping.json"),
        feature_names_path: data_dir.join("feature_names.json"),
        expected_features: DEFAULT_EXPECTED_FEATURES,
        top_k: DEFAULT_TOP_K,
    });
    if !detector.model_loaded() {
        eyre::bail!("no model could be loaded; see the log output above");
    }

    if let Some(path) = csv {
        let bytes =
            std::fs::read(&path).wrap_err_with(|| format!("Failed to read {}", path.display()))?;
        let batch = parse_csv(&bytes)?;
        let results = run_batch(&detector, &batch)?;
        match format.as_str() {
            "json" => println!("{}", serde_json::to_string_pretty(&results)?),
            _ => print!("{}", format_summary(&results)),
        }
        let any_attack = results.iter().any(|r| match r {
            xai_ids::batch::RowResult::Scored { prediction, .. } => prediction.attack.is_vulnerable,
            xai_ids::batch::RowResult::Failed { .. } => false,
        });
        return Ok(if any_attack { 1 } else { 0 });
    }

    let values = parse_feature_list(features.as_deref().unwrap_or_default())?;
    let prediction = detector.predict(&values)?;

    match format.as_str() {
        "json" => {
            let result = serde_json::json!({
                "success": true,
                "prediction": prediction,
                "model_hash": detector.model_hash(),
            });
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            println!("Intrusion Detection Result");
            println!("==========================");
            println!("Attack type:  {}", prediction.attack.attack_type);
            println!("Status:       {}", prediction.attack.vulnerability_status);
            println!("Class id:     {}", prediction.class_id);
            println!(
                "Features:     {} provided, {} expected",
                prediction.features_used, prediction.features_expected
            );
            println!();
            println!("Base value:   {:+.4}", prediction.base_value);
            println!("Top features:");
            for c in &prediction.top_features_detailed {
                println!(
                    "  [{:>3}] {:<32} value={:<12} shap={:+.4}",
                    c.feature_idx, c.feature_name, c.feature_value, c.shap_value
                );
            }
            println!();
            println!("Model Hash: {}", detector.model_hash().unwrap_or("-"));
        }
    }

    Ok(if prediction.attack.is_vulnerable { 1 } else { 0 })
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Serve {
            bind,
            data_dir,
            model_path,
            access_log,
            top_k,
            smtp_server,
            smtp_port,
            smtp_user,
            smtp_password,
            frontend_url,
            cors_origins,
        } => cmd_serve(ServeArgs {
            bind,
            data_dir,
            model_path,
            access_log,
            top_k,
            smtp: SmtpSettings {
                server: smtp_server,
                port: smtp_port,
                user: smtp_user,
                password: smtp_password,
            },
            frontend_url,
            cors_origins,
        }),
        Commands::Predict {
            features,
            csv,
            model_path,
            data_dir,
            format,
        } => match cmd_predict(features, csv, model_path, data_dir, format) {
            Ok(code) => {
                if code != 0 {
                    std::process::exit(code);
                }
                Ok(())
            }
            Err(e) => Err(e),
        },
    };

    if let Err(e) = result {
        eprintln!("Error: {e:?}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xai_ids::server::ServerConfig;

    #[test]
    fn test_serve_bind_default_matches_server_config() {
        let cli = Cli::try_parse_from(["xai-ids", "serve"]).unwrap();
        let Commands::Serve { bind, .. } = cli.command else {
            panic!("expected serve");
        };
        if std::env::var_os("XAI_IDS_BIND").is_none() {
            assert_eq!(bind, ServerConfig::default().bind_addr.to_string());
        }
    }

    #[test]
    fn test_parse_feature_list() {
        assert_eq!(
            parse_feature_list("1, 2.5,,3").unwrap(),
            vec![1.0, 2.5, 3.0]
        );
        assert!(parse_feature_list("1,abc").is_err());
    }
}
