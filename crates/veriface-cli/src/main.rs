use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use veriface_core::synthetic::SyntheticFace;
use veriface_core::{Embedding, LivenessChallenge, Observation, Population};
use veriface_source::{json_lines_file, JsonLinesOptions};
use verifaced::config::load_challenge;
use verifaced::session::{run_liveness, verify_login, VerifyConfig};
use verifaced::IdentityStore;

#[derive(Parser)]
#[command(name = "veriface", about = "Veriface liveness-gated face verification CLI")]
struct Cli {
    /// Talk to the daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a liveness-gated login for an identity key
    Verify {
        /// Identity key the user claims to be
        key: String,
        #[command(flatten)]
        session: SessionArgs,
    },
    /// Capture a live face and register it under an identity key
    Register {
        key: String,
        #[command(flatten)]
        session: SessionArgs,
    },
    /// Cancel a running session
    Cancel {
        token: String,
    },
    /// Show daemon status
    Status,
    /// List registered identity keys
    List,
    /// Run a recorded JSON-lines observation file through the liveness check locally
    Replay(ReplayArgs),
    /// Write a JSON-lines script that passes the default challenge
    DemoScript {
        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// JSON array of 128 floats attached to the final observation
        #[arg(long)]
        embedding: Option<PathBuf>,
    },
}

#[derive(Args)]
struct SessionArgs {
    /// Session token, usable with `veriface cancel` (default: generated)
    #[arg(long, default_value = "")]
    token: String,
}

#[derive(Args)]
struct ReplayArgs {
    /// JSON-lines observation file
    file: PathBuf,
    /// TOML challenge file (default: blink, smile, turn)
    #[arg(long)]
    challenge: Option<PathBuf>,
    /// Also match against this identity store, claiming KEY
    #[arg(long, requires = "store")]
    claim: Option<String>,
    /// Identity store JSON file
    #[arg(long)]
    store: Option<PathBuf>,
    /// Match distance threshold
    #[arg(long, default_value_t = 0.5)]
    threshold: f32,
    /// Sleep between observations by their timestamp deltas
    #[arg(long)]
    paced: bool,
}

// `#[zbus::proxy]` generates `VerifierProxy` (async) and `VerifierProxyBlocking`.
#[zbus::proxy(
    interface = "org.veriface.Verifier1",
    default_service = "org.veriface.Verifier1",
    default_path = "/org/veriface/Verifier1"
)]
trait Verifier {
    async fn verify_login(&self, claimed_key: &str, session_token: &str) -> zbus::Result<String>;
    async fn register(&self, identity_key: &str, session_token: &str) -> zbus::Result<String>;
    async fn cancel(&self, session_token: &str) -> zbus::Result<bool>;
    async fn status(&self) -> zbus::Result<String>;
    async fn list_identities(&self) -> zbus::Result<String>;
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Verify { key, session } => {
            let proxy = connect(cli.system).await?;
            if !session.token.is_empty() {
                eprintln!("session token: {}", session.token);
            }
            eprintln!("Follow the prompts: blink, smile, then turn your head.");
            let verdict = print_json(&proxy.verify_login(&key, &session.token).await?)?;
            Ok(exit_code(json_flag(&verdict, "accepted")))
        }
        Commands::Register { key, session } => {
            let proxy = connect(cli.system).await?;
            eprintln!("Follow the prompts: blink, smile, then turn your head.");
            let report = print_json(&proxy.register(&key, &session.token).await?)?;
            Ok(exit_code(json_flag(&report, "registered")))
        }
        Commands::Cancel { token } => {
            let cancelled = connect(cli.system).await?.cancel(&token).await?;
            println!("{}", if cancelled { "cancelled" } else { "no such session" });
            Ok(exit_code(cancelled))
        }
        Commands::Status => {
            print_json(&connect(cli.system).await?.status().await?)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::List => {
            print_json(&connect(cli.system).await?.list_identities().await?)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Replay(args) => replay(args).await,
        Commands::DemoScript { output, embedding } => {
            demo_script(output, embedding)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn connect(system: bool) -> Result<VerifierProxy<'static>> {
    tracing::debug!(system, "connecting to verifaced");
    let conn = if system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("failed to connect to D-Bus")?;
    VerifierProxy::new(&conn)
        .await
        .context("verifaced is not reachable")
}

async fn replay(args: ReplayArgs) -> Result<ExitCode> {
    let challenge = match &args.challenge {
        Some(path) => load_challenge(path)?,
        None => LivenessChallenge::default(),
    };
    challenge.validate()?;
    let options = JsonLinesOptions {
        paced: args.paced,
        ..JsonLinesOptions::default()
    };
    let lease = json_lines_file(args.file.clone(), options);
    tracing::debug!(
        file = %args.file.display(),
        steps = challenge.steps.len(),
        "replaying observations"
    );

    let (Some(claim), Some(store)) = (&args.claim, &args.store) else {
        let result = run_liveness(lease, &challenge).await;
        for (step, satisfied) in &result.per_step_satisfied {
            println!("{:<12} {}", step, if *satisfied { "ok" } else { "-" });
        }
        println!("observations: {}", result.observations);
        match &result.failure {
            Some(reason) => println!("liveness: FAILED ({reason})"),
            None => println!(
                "liveness: passed, embedding {}",
                if result.captured_embedding.is_some() { "captured" } else { "missing" }
            ),
        }
        return Ok(exit_code(result.passed));
    };

    let population = Population::new(IdentityStore::new(store).load()?);
    let config = VerifyConfig {
        challenge,
        match_threshold: args.threshold,
    };
    let verdict = verify_login(claim, lease, &population, &config).await?;
    println!("{}", serde_json::to_string_pretty(&verdict)?);
    Ok(exit_code(verdict.accepted))
}

fn demo_script(output: Option<PathBuf>, embedding: Option<PathBuf>) -> Result<()> {
    let embedding = match embedding {
        Some(path) => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let values: Vec<f32> = serde_json::from_str(&text)?;
            Some(Embedding::new(values)?)
        }
        None => None,
    };

    let mut last = SyntheticFace::new(400).nose_at(220.0, 160.0);
    if let Some(embedding) = embedding {
        last = last.embedding(embedding);
    }
    let script: Vec<Observation> = vec![
        SyntheticFace::new(0).build(),
        SyntheticFace::new(100).eyes_closed().build(),
        SyntheticFace::new(200).build(),
        SyntheticFace::new(300).expression("happy", 0.9).build(),
        last.build(),
    ];

    let mut out: Box<dyn Write> = match &output {
        Some(path) => Box::new(std::fs::File::create(path)?),
        None => Box::new(std::io::stdout().lock()),
    };
    writeln!(out, "# veriface demo script: blink, smile, turn")?;
    for observation in &script {
        writeln!(out, "{}", serde_json::to_string(observation)?)?;
    }
    out.flush()?;
    Ok(())
}

fn print_json(text: &str) -> Result<serde_json::Value> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(value)
}

fn json_flag(value: &serde_json::Value, key: &str) -> bool {
    value.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_verify_with_token() {
        let cli = Cli::parse_from(["veriface", "verify", "12345678", "--token", "abc"]);
        match cli.command {
            Commands::Verify { key, session } => {
                assert_eq!(key, "12345678");
                assert_eq!(session.token, "abc");
            }
            _ => panic!("expected verify"),
        }
    }

    #[test]
    fn test_replay_claim_requires_store() {
        assert!(Cli::try_parse_from(["veriface", "replay", "obs.jsonl", "--claim", "x"]).is_err());
    }

    #[tokio::test]
    async fn test_demo_script_passes_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("demo.jsonl");
        demo_script(Some(path.clone()), None).unwrap();

        let lease = json_lines_file(path, JsonLinesOptions::default());
        let result = run_liveness(lease, &LivenessChallenge::default()).await;
        assert!(result.passed);
        assert!(result.captured_embedding.is_none());
    }
}
