use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};
use std::path::PathBuf;
use std::sync::{OnceLock, RwLock};

use tracing_subscriber::EnvFilter;

pub type CommandResult<T> = Result<T, CoreError>;

mod runtime {
    use serde::Serialize;
    use std::ffi::CString;
    use std::os::raw::c_char;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, OnceLock, RwLock};

    use crate::error::CoreError;
    use crate::CommandResult;

    /// Host hook receiving `(event name, JSON payload)` pairs.
    pub type EventCallback = extern "C" fn(*const c_char, *const c_char);

    static EVENT_CALLBACK: OnceLock<RwLock<Option<EventCallback>>> = OnceLock::new();

    fn callback_cell() -> &'static RwLock<Option<EventCallback>> {
        EVENT_CALLBACK.get_or_init(|| RwLock::new(None))
    }

    pub fn set_event_callback(callback: Option<EventCallback>) {
        if let Ok(mut writer) = callback_cell().write() {
            *writer = callback;
        }
    }

    fn event_string(label: &str, value: String) -> CommandResult<CString> {
        CString::new(value)
            .map_err(|_| CoreError::Configuration(format!("{label} contains a null byte")))
    }

    /// Location of the record store, passed explicitly to every command that
    /// touches it.
    #[derive(Clone, Debug)]
    pub struct AppHandle {
        data_dir: Arc<PathBuf>,
    }

    impl AppHandle {
        pub fn new(data_dir: PathBuf) -> Self {
            Self {
                data_dir: Arc::new(data_dir),
            }
        }

        pub fn data_dir(&self) -> &Path {
            &self.data_dir
        }

        /// Forwards a run event to the host. Without a registered callback the
        /// event is dropped.
        pub fn emit<S: Serialize>(&self, event: &str, payload: S) -> CommandResult<()> {
            let callback = callback_cell().read().ok().and_then(|reader| *reader);
            let Some(callback) = callback else {
                return Ok(());
            };

            let event = event_string("Event name", event.to_string())?;
            let payload = event_string("Event payload", serde_json::to_string(&payload)?)?;
            callback(event.as_ptr(), payload.as_ptr());
            Ok(())
        }
    }

    pub mod async_runtime {
        use std::future::Future;
        use std::sync::OnceLock;
        use tokio::runtime::{Builder, Runtime};
        use tokio::task::JoinHandle;

        static RUNTIME: OnceLock<Runtime> = OnceLock::new();

        fn runtime() -> &'static Runtime {
            RUNTIME.get_or_init(|| {
                Builder::new_multi_thread()
                    .thread_name("catalog-core")
                    .enable_all()
                    .build()
                    .expect("failed to build async runtime")
            })
        }

        /// Runs store reads and batch commits off the async workers.
        pub fn spawn_blocking<F, R>(function: F) -> JoinHandle<R>
        where
            F: FnOnce() -> R + Send + 'static,
            R: Send + 'static,
        {
            runtime().spawn_blocking(function)
        }

        pub fn block_on<F>(future: F) -> F::Output
        where
            F: Future,
        {
            runtime().block_on(future)
        }
    }
}

mod batch;
mod commands;
mod config;
mod db;
mod error;
mod fields;
mod indexer;
mod search;
mod types;
mod util;

pub use batch::{MutationBatch, MutationSink};
pub use config::BackfillConfig;
pub use db::{RecordSource, SqliteStore};
pub use error::CoreError;
pub use runtime::{set_event_callback, AppHandle, EventCallback};
pub use types::{
    BackfillStats, BatchOutcome, FieldUpdate, FieldValue, PendingMutation, RawRecord, RecordRef,
};

pub mod async_runtime {
    pub use crate::runtime::async_runtime::{block_on, spawn_blocking};
}

static APP_HANDLE: OnceLock<RwLock<Option<AppHandle>>> = OnceLock::new();

fn app_handle_cell() -> &'static RwLock<Option<AppHandle>> {
    APP_HANDLE.get_or_init(|| RwLock::new(None))
}

fn current_app_handle() -> CommandResult<AppHandle> {
    let reader = app_handle_cell()
        .read()
        .map_err(|_| CoreError::Task("Could not read app configuration".to_string()))?;
    reader.as_ref().cloned().ok_or(CoreError::NotConfigured)
}

fn set_app_handle(app_handle: AppHandle) -> CommandResult<()> {
    let mut writer = app_handle_cell()
        .write()
        .map_err(|_| CoreError::Task("Could not update app configuration".to_string()))?;
    *writer = Some(app_handle);
    Ok(())
}

#[derive(Deserialize)]
struct InvokeRequest {
    command: String,
    #[serde(default)]
    args: Value,
}

#[derive(Serialize)]
struct InvokeResponse {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NormalizeTextArgs {
    #[serde(default)]
    text: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeriveTokensArgs {
    #[serde(default)]
    text: String,
    lengths: Option<Vec<usize>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BuildFieldUpdateArgs {
    #[serde(default)]
    record: Map<String, Value>,
    token_lengths: Option<Vec<usize>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PutRecordsArgs {
    collection: String,
    records: Vec<commands::RecordInput>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetRecordArgs {
    collection: String,
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BackfillArgs {
    collection: String,
    config: Option<BackfillConfig>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoveFieldArgs {
    collection: String,
    field: String,
    config: Option<BackfillConfig>,
}

fn parse_args<T: DeserializeOwned>(value: Value) -> CommandResult<T> {
    serde_json::from_value(value).map_err(CoreError::from)
}

fn to_json_value<T: Serialize>(value: T) -> CommandResult<Value> {
    serde_json::to_value(value).map_err(CoreError::from)
}

fn invoke_command(request: InvokeRequest) -> CommandResult<Value> {
    let InvokeRequest { command, args } = request;

    match command.as_str() {
        "normalize_text" => {
            let args: NormalizeTextArgs = parse_args(args)?;
            to_json_value(commands::normalize_text(args.text))
        }
        "derive_tokens" => {
            let args: DeriveTokensArgs = parse_args(args)?;
            to_json_value(commands::derive_tokens(args.text, args.lengths))
        }
        "build_field_update" => {
            let args: BuildFieldUpdateArgs = parse_args(args)?;
            to_json_value(commands::build_field_update(args.record, args.token_lengths))
        }
        "put_records" => {
            let args: PutRecordsArgs = parse_args(args)?;
            let app = current_app_handle()?;
            to_json_value(commands::put_records(app, args.collection, args.records)?)
        }
        "get_record" => {
            let args: GetRecordArgs = parse_args(args)?;
            let app = current_app_handle()?;
            to_json_value(commands::get_record(app, args.collection, args.id)?)
        }
        "backfill_search_fields" => {
            let args: BackfillArgs = parse_args(args)?;
            let app = current_app_handle()?;
            to_json_value(async_runtime::block_on(commands::backfill_search_fields(
                app,
                args.collection,
                args.config,
            ))?)
        }
        "remove_field" => {
            let args: RemoveFieldArgs = parse_args(args)?;
            let app = current_app_handle()?;
            to_json_value(async_runtime::block_on(commands::remove_field(
                app,
                args.collection,
                args.field,
                args.config,
            ))?)
        }
        _ => Err(CoreError::Configuration(format!("Unknown command: {command}"))),
    }
}

fn invoke_json(raw: &str) -> InvokeResponse {
    match serde_json::from_str::<InvokeRequest>(raw)
        .map_err(CoreError::from)
        .and_then(invoke_command)
    {
        Ok(value) => InvokeResponse {
            ok: true,
            value: Some(value),
            error: None,
        },
        Err(error) => InvokeResponse {
            ok: false,
            value: None,
            error: Some(error.to_string()),
        },
    }
}

fn response_json_pointer(response: InvokeResponse) -> *mut c_char {
    let raw = serde_json::to_string(&response).unwrap_or_else(|error| {
        format!("{{\"ok\":false,\"error\":\"Could not serialize response: {error}\"}}")
    });

    CString::new(raw)
        .unwrap_or_else(|_| {
            CString::new("{\"ok\":false,\"error\":\"Response contains null byte\"}")
                .expect("fallback JSON string is valid")
        })
        .into_raw()
}

/// Copies a host string; null pointers and invalid UTF-8 are rejected.
unsafe fn read_c_string(ptr: *const c_char) -> CommandResult<String> {
    if ptr.is_null() {
        return Err(CoreError::Configuration("Received null pointer".to_string()));
    }

    CStr::from_ptr(ptr)
        .to_str()
        .map(str::to_string)
        .map_err(|error| {
            CoreError::Configuration(format!("Could not decode UTF-8 string: {error}"))
        })
}

#[no_mangle]
pub extern "C" fn core_set_event_callback(callback: Option<EventCallback>) {
    set_event_callback(callback);
}

/// Installs a stderr log subscriber. Returns 0 if one was already installed.
#[no_mangle]
pub extern "C" fn core_init_logging(filter_ptr: *const c_char) -> c_int {
    let filter = unsafe { read_c_string(filter_ptr) }
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| "info".to_string());
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));

    match tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init()
    {
        Ok(()) => 1,
        Err(_) => 0,
    }
}

#[no_mangle]
pub extern "C" fn core_configure(app_data_dir_ptr: *const c_char) -> c_int {
    let Ok(app_data_dir) = (unsafe { read_c_string(app_data_dir_ptr) }) else {
        return 0;
    };
    let trimmed = app_data_dir.trim();
    if trimmed.is_empty() {
        return 0;
    }

    if set_app_handle(AppHandle::new(PathBuf::from(trimmed))).is_err() {
        return 0;
    }

    1
}

#[no_mangle]
pub extern "C" fn core_invoke_json(request_ptr: *const c_char) -> *mut c_char {
    let response = match unsafe { read_c_string(request_ptr) } {
        Ok(raw) => invoke_json(&raw),
        Err(error) => InvokeResponse {
            ok: false,
            value: None,
            error: Some(error.to_string()),
        },
    };

    response_json_pointer(response)
}

#[no_mangle]
pub extern "C" fn core_free_str(response_ptr: *mut c_char) {
    if response_ptr.is_null() {
        return;
    }
    unsafe {
        drop(CString::from_raw(response_ptr));
    }
}
