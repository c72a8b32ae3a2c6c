//! Operator tool for a running DAQflow engine.
//!
//! Sends one control request over NATS, waits for the engine's reply and
//! prints it as JSON. The exit status is non-zero when the engine refuses
//! the request or does not answer in time.
//!
//! ```text
//! daqflow-ctl run --workflow stf_datataking --stf-count 10 --no-realtime
//! daqflow-ctl stop --execution-id stf_datataking-alice-0001
//! daqflow-ctl status
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use daqflow_core::config::{CONFIG_PATH_ENV, DEFAULT_CONFIG_FILE, EngineConfig};
use daqflow_types::{
    ControlRequest, ControlResponse, ExecutionId, RunWorkflowRequest, StatusQuery,
    StopWorkflowRequest,
};
use serde_json::{Map, Value};
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Command-line arguments.
#[derive(Parser)]
#[command(name = "daqflow-ctl")]
#[command(about = "Send control requests to a DAQflow engine", long_about = None)]
#[command(version)]
struct Cli {
    /// Request to send.
    #[command(subcommand)]
    command: Command,

    /// Engine configuration file (for NATS URL, namespace and destinations).
    #[arg(long, env = CONFIG_PATH_ENV, default_value = DEFAULT_CONFIG_FILE, global = true)]
    engine_config: PathBuf,

    /// Override the NATS server URL.
    #[arg(long, global = true)]
    nats_url: Option<String>,

    /// Override the namespace the request is addressed to.
    #[arg(long, global = true)]
    namespace: Option<String>,

    /// Seconds to wait for the engine's reply.
    #[arg(long, default_value_t = 10, global = true)]
    timeout: u64,
}

/// One control request per subcommand.
#[derive(Subcommand)]
enum Command {
    /// Start a workflow execution.
    Run(RunArgs),
    /// Cancel a running execution.
    Stop {
        /// Execution to cancel.
        #[arg(long)]
        execution_id: String,
    },
    /// Report on one or all executions.
    Status {
        /// Execution to report on.
        #[arg(long)]
        execution_id: Option<String>,
    },
}

/// Arguments of `daqflow-ctl run`.
#[derive(Args)]
struct RunArgs {
    /// Workflow kind.
    #[arg(long, default_value = "stf_datataking")]
    workflow: String,

    /// Parameter profile to start from.
    #[arg(long)]
    config: Option<String>,

    /// Total number of STF files to produce.
    #[arg(long)]
    stf_count: Option<u64>,

    /// Pace the execution by the wall clock.
    #[arg(long, overrides_with = "no_realtime")]
    realtime: bool,

    /// Run as fast as possible.
    #[arg(long)]
    no_realtime: bool,

    /// Parameter override as `key=value`. Values are parsed as JSON and
    /// fall back to a plain string.
    #[arg(long = "param", value_name = "KEY=VALUE")]
    params: Vec<String>,

    /// Operator identity recorded on the execution.
    #[arg(long)]
    executed_by: Option<String>,
}

impl RunArgs {
    /// Requested pacing; `None` leaves it to the engine.
    const fn realtime(&self) -> Option<bool> {
        if self.realtime {
            Some(true)
        } else if self.no_realtime {
            Some(false)
        } else {
            None
        }
    }
}

/// Send one request and print the engine's reply.
///
/// # Errors
///
/// Returns an error if the configuration cannot be loaded, the NATS
/// server is unreachable, or no reply arrives within the timeout.
#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = EngineConfig::load(&cli.engine_config)
        .with_context(|| format!("loading {}", cli.engine_config.display()))?;
    if let Some(url) = &cli.nats_url {
        config.infrastructure.nats_url.clone_from(url);
    }
    if cli.namespace.is_some() {
        config.engine.namespace.clone_from(&cli.namespace);
    }

    let request = build_request(&cli.command, config.engine.namespace.clone())?;
    let destinations = config.destinations.resolve()?;
    let subject = destinations.control.name().to_owned();
    debug!(subject, msg_type = request.msg_type(), "Sending control request");

    let client = async_nats::connect(&config.infrastructure.nats_url)
        .await
        .with_context(|| format!("connecting to {}", config.infrastructure.nats_url))?;
    let payload = serde_json::to_vec(&request)?;
    let reply = tokio::time::timeout(
        Duration::from_secs(cli.timeout),
        client.request(subject.clone(), payload.into()),
    )
    .await
    .with_context(|| format!("no reply on {subject} within {}s", cli.timeout))?
    .with_context(|| format!("request on {subject} failed"))?;

    let response: ControlResponse =
        serde_json::from_slice(&reply.payload).context("decoding engine reply")?;
    println!("{}", serde_json::to_string_pretty(&response)?);

    Ok(if response.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Build the control request for a subcommand.
fn build_request(command: &Command, namespace: Option<String>) -> Result<ControlRequest> {
    let request = match command {
        Command::Run(args) => {
            let mut params = parse_params(&args.params)?;
            if let Some(count) = args.stf_count {
                params.insert("stf_count".to_owned(), Value::from(count));
            }
            ControlRequest::RunWorkflow(RunWorkflowRequest {
                namespace,
                workflow_name: args.workflow.clone(),
                config: args.config.clone(),
                realtime: args.realtime(),
                params,
                executed_by: args.executed_by.clone(),
            })
        }
        Command::Stop { execution_id } => ControlRequest::StopWorkflow(StopWorkflowRequest {
            namespace,
            execution_id: ExecutionId::from(execution_id.as_str()),
        }),
        Command::Status { execution_id } => ControlRequest::StatusRequest(StatusQuery {
            namespace,
            execution_id: execution_id.as_deref().map(ExecutionId::from),
        }),
    };
    Ok(request)
}

/// Parse `key=value` overrides into a parameter object.
fn parse_params(pairs: &[String]) -> Result<Map<String, Value>> {
    let mut params = Map::new();
    for pair in pairs {
        let Some((key, raw)) = pair.split_once('=') else {
            bail!("parameter `{pair}` is not of the form key=value");
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("parameter `{pair}` has an empty key");
        }
        let value = serde_json::from_str(raw.trim()).unwrap_or_else(|_| Value::from(raw.trim()));
        params.insert(key.to_owned(), value);
    }
    Ok(params)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    fn run_args(params: &[&str]) -> RunArgs {
        RunArgs {
            workflow: "stf_datataking".to_owned(),
            config: None,
            stf_count: None,
            realtime: false,
            no_realtime: false,
            params: params.iter().map(|p| (*p).to_owned()).collect(),
            executed_by: None,
        }
    }

    #[test]
    fn params_parse_json_values_and_fall_back_to_strings() {
        let params = parse_params(&[
            "stf_interval=0.5".to_owned(),
            "physics_period_count=2".to_owned(),
            "allow_unbounded=true".to_owned(),
            "label=calibration run".to_owned(),
        ])
        .unwrap();

        assert_eq!(params["stf_interval"], 0.5);
        assert_eq!(params["physics_period_count"], 2);
        assert_eq!(params["allow_unbounded"], true);
        assert_eq!(params["label"], "calibration run");
    }

    #[test]
    fn params_reject_missing_separator_and_empty_key() {
        assert!(parse_params(&["stf_interval".to_owned()]).is_err());
        assert!(parse_params(&["=3".to_owned()]).is_err());
    }

    #[test]
    fn run_request_carries_overrides() {
        let mut args = run_args(&["stf_interval=1"]);
        args.stf_count = Some(5);
        args.no_realtime = true;
        args.config = Some("fast_processing".to_owned());

        let request = build_request(&Command::Run(args), Some("testbed".to_owned())).unwrap();
        let ControlRequest::RunWorkflow(run) = request else {
            panic!("expected run_workflow");
        };
        assert_eq!(run.namespace.as_deref(), Some("testbed"));
        assert_eq!(run.config.as_deref(), Some("fast_processing"));
        assert_eq!(run.realtime, Some(false));
        assert_eq!(run.params["stf_count"], 5);
        assert_eq!(run.params["stf_interval"], 1);
    }

    #[test]
    fn realtime_defaults_to_engine_choice() {
        assert_eq!(run_args(&[]).realtime(), None);
    }

    #[test]
    fn stop_and_status_serialize_with_msg_type() {
        let stop = build_request(
            &Command::Stop {
                execution_id: "stf_datataking-alice-0001".to_owned(),
            },
            None,
        )
        .unwrap();
        let json = serde_json::to_value(&stop).unwrap();
        assert_eq!(json["msg_type"], "stop_workflow");
        assert_eq!(json["execution_id"], "stf_datataking-alice-0001");
        assert!(json.get("namespace").is_none());

        let status = build_request(&Command::Status { execution_id: None }, None).unwrap();
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["msg_type"], "status_request");
        assert!(json.get("execution_id").is_none());
    }

    #[test]
    fn cli_parses_run_flags() {
        let cli = Cli::try_parse_from([
            "daqflow-ctl",
            "run",
            "--stf-count",
            "3",
            "--param",
            "stf_interval=2",
            "--realtime",
        ])
        .unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.stf_count, Some(3));
        assert_eq!(args.realtime(), Some(true));
        assert_eq!(args.params, vec!["stf_interval=2".to_owned()]);
    }
}
