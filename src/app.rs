//! Defines the per-invocation application state and the event
//! handler that drives the pipeline: parse, gate, fetch, summarize,
//! package.

use crate::client;
use crate::conf::{Context, Settings};
use crate::debounce::check_time;
use crate::error::PipelineError;
use crate::package::Packager;
use crate::registry::{validate_package_name, QuiltRegistry, Registry};
use crate::report::{download_report, summarize_tables};
use crate::storage::{Location, Storage};
use crate::store::{ParameterStore, SsmParameterStore};
use crate::trigger::{parse_event, PipelineOptions, TriggerKind};
use anyhow::Result;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, instrument, warn};

/// The outcome of an invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub body: Value,
}

impl Response {
    fn new(status_code: u16, mut body: Value, message: impl Into<String>) -> Self {
        body["message"] = Value::String(message.into());
        Response { status_code, body }
    }
}

/// The locations an invocation reads from and writes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    /// The report to decode.
    pub report: Location,
    /// Where the decoded tables are written.
    pub tables_root: Location,
    /// The folder that is summarized and packaged.
    pub package_root: Location,
}

impl Plan {
    /// For a workflow run, the report lives at a fixed suffix of the
    /// run output and the whole run output is packaged. For a stored
    /// object, the object is the report and its grandparent folder is
    /// packaged. In both cases tables land in the report's grandparent
    /// folder.
    pub fn new(options: &PipelineOptions, settings: &Settings) -> Result<Self> {
        let uri = Location::parse(&options.uri)?;
        Ok(match options.kind {
            TriggerKind::RunStatus => {
                let report = uri.join(&settings.report_suffix);
                Plan {
                    tables_root: report.ancestor(2),
                    report,
                    package_root: uri,
                }
            }
            TriggerKind::Storage => {
                let root = uri.ancestor(2);
                Plan {
                    report: uri,
                    tables_root: root.clone(),
                    package_root: root,
                }
            }
        })
    }
}

/// An App is the application state of a single invocation.
pub struct App {
    pub context: Context,
    pub settings: Settings,
    pub storage: Storage,
    pub store: Box<dyn ParameterStore>,
    pub registry: Box<dyn Registry>,
}

impl App {
    /// Initialize an App instance given a resolved context and its
    /// collaborators.
    pub fn new(
        context: Context,
        storage: Storage,
        store: Box<dyn ParameterStore>,
        registry: Box<dyn Registry>,
    ) -> Result<Self> {
        let settings = context.settings()?;
        Ok(App {
            context,
            settings,
            storage,
            store,
            registry,
        })
    }

    /// Initialize an App instance backed by the global AWS clients.
    pub fn with_aws(context: Context) -> Result<Self> {
        let settings = context.settings()?;
        let prefix = settings
            .parameter_prefix
            .clone()
            .unwrap_or_else(|| settings.app_name.clone());
        let storage = Storage::current();
        Ok(App {
            context,
            settings,
            store: Box::new(SsmParameterStore::new(client::ssm().clone(), &prefix)),
            registry: Box::new(QuiltRegistry::new(storage.clone())),
            storage,
        })
    }

    /// Handle a raw event. Conditions that map onto a status code are
    /// reported in the response; every other failure is returned.
    #[instrument(skip_all)]
    pub async fn handle_event(&self, event: &Value) -> Result<Response> {
        let body = json!({"message": "N/A", "event": event});
        match self.run(event, body.clone()).await {
            Ok(response) => Ok(response),
            Err(e) => {
                let reported = e
                    .downcast_ref::<PipelineError>()
                    .and_then(|condition| Some((condition.status_code()?, condition.to_string())));
                match reported {
                    Some((status_code, condition)) => {
                        warn!("{}", condition);
                        Ok(Response::new(status_code, body, format!("ERROR: {}", condition)))
                    }
                    None => Err(e),
                }
            }
        }
    }

    async fn run(&self, event: &Value, mut body: Value) -> Result<Response> {
        let envelope = parse_event(event)?;
        let event_type = match envelope.event_type() {
            Some(event_type) if !event_type.is_empty() => event_type,
            _ => return Ok(Response::new(400, body, "ERROR: No type")),
        };
        if event_type != envelope.kind().accepted_type() {
            return Err(PipelineError::UnsupportedEventType(String::from(event_type)).into());
        }
        let options = envelope.options()?;
        body["opts"] = serde_json::to_value(&options)?;
        validate_package_name(&options.package)?;

        if options.debug {
            info!("Debug event; skipping the debounce check");
        } else if !check_time(self.store.as_ref(), &options.uri, self.context.timeout()?).await? {
            return Ok(Response::new(200, body, "Not ready"));
        }

        let plan = Plan::new(&options, &self.settings)?;
        info!(?plan, "Processing");
        let tables = download_report(&self.storage, &plan.report, &plan.tables_root).await?;
        if tables.is_empty() {
            return Ok(Response::new(
                200,
                body,
                format!("No tables in {}", plan.report),
            ));
        }
        summarize_tables(
            &self.storage,
            &tables,
            &plan.package_root,
            &self.settings.quilt_summarize,
        )
        .await?;

        let packager = Packager {
            storage: &self.storage,
            registry: self.registry.as_ref(),
            context: &self.context,
            settings: &self.settings,
        };
        let meta = packager.package_folder(&plan.package_root, &options).await?;
        body["opts"] = Value::Object(meta);
        Ok(Response::new(
            201,
            body,
            format!("{} @ {}", plan.report, plan.package_root),
        ))
    }
}
