//! JSON-RPC method dispatch
//!
//! The routing table is built once per [`Dispatcher`]. A request goes
//! through parse, envelope checks, method lookup, `validate` and finally
//! `handle`; every response carries the request id whenever it could be read.
//!
//! Methods addressing devices take an optional `name`. Without it every
//! registered device of the method's kind is targeted and the result is a
//! per-device list, where one failing device does not hide the others.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use libsynaps_core::{AdapterError, DeviceKind, RelayCommand};
use libsynaps_ipc::error::codes;
use libsynaps_ipc::{ErrorObject, Handler, ResponseEnvelope, JSONRPC_VERSION};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error};

use crate::registry::{Registry, SharedAdapter};

/// Error reported to the caller in the response `error` member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub code: i64,
    pub message: String,
}

impl ApiError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn missing_field(field: &str) -> Self {
        Self::new(codes::INVALID_PARAMS, format!("Missing field: {}", field))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_PARAMS, message)
    }

    pub fn device_not_found(name: &str) -> Self {
        Self::new(codes::DEVICE_NOT_FOUND, format!("Device {} not found", name))
    }

    pub fn no_devices() -> Self {
        Self::new(codes::NO_DEVICES, "No devices found")
    }

    pub fn unknown_command(command: &str) -> Self {
        Self::new(
            codes::UNKNOWN_COMMAND,
            format!("Command {} is not recognized", command),
        )
    }

    pub fn not_config_command(command: &str) -> Self {
        Self::new(
            codes::NOT_CONFIG_COMMAND,
            format!("Command {} is not a configuration command", command),
        )
    }

    pub fn internal() -> Self {
        Self::new(codes::INTERNAL_ERROR, "Internal error")
    }

    fn to_value(&self) -> Value {
        json!({ "code": self.code, "message": self.message })
    }
}

impl From<&AdapterError> for ApiError {
    fn from(err: &AdapterError) -> Self {
        match err {
            AdapterError::UnknownCommand(c) => ApiError::unknown_command(c),
            AdapterError::NotConfigCommand(c) => ApiError::not_config_command(c),
            AdapterError::InvalidArgument(msg) => ApiError::invalid_params(msg.clone()),
            other => ApiError::new(codes::INTERNAL_ERROR, other.to_string()),
        }
    }
}

impl From<ApiError> for ErrorObject {
    fn from(err: ApiError) -> Self {
        ErrorObject::new(err.code, err.message)
    }
}

/// Shared state handed to every method
#[derive(Clone)]
pub struct ApiContext {
    pub registry: Arc<Registry>,
}

#[async_trait]
pub trait ApiMethod: Send + Sync {
    fn name(&self) -> &'static str;

    /// Reject malformed params before any device is touched
    fn validate(&self, _params: &Value) -> Result<(), ApiError> {
        Ok(())
    }

    async fn handle(&self, ctx: &ApiContext, params: &Value) -> Result<Value, ApiError>;
}

fn str_param<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}

fn require_str<'a>(params: &'a Value, key: &str) -> Result<&'a str, ApiError> {
    match str_param(params, key) {
        Some(s) if !s.is_empty() => Ok(s),
        _ => Err(ApiError::missing_field(key)),
    }
}

/// `args` as strings; numbers and booleans are accepted verbatim
fn string_args(params: &Value) -> Result<Vec<String>, ApiError> {
    match params.get("args") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.clone()),
                Value::Number(n) => Ok(n.to_string()),
                Value::Bool(b) => Ok(b.to_string()),
                other => Err(ApiError::invalid_params(format!(
                    "args must be strings, got {}",
                    other
                ))),
            })
            .collect(),
        Some(_) => Err(ApiError::invalid_params("args must be a list")),
    }
}

/// Devices addressed by `params.name`
async fn targets(
    ctx: &ApiContext,
    kind: DeviceKind,
    params: &Value,
) -> Result<Vec<SharedAdapter>, ApiError> {
    match params.get("name") {
        None | Some(Value::Null) => {
            let devices = ctx.registry.of_kind(kind).await;
            if devices.is_empty() {
                return Err(ApiError::no_devices());
            }
            Ok(devices)
        }
        Some(Value::String(name)) => match ctx.registry.get(name).await {
            Some(device) if device.kind() == kind => Ok(vec![device]),
            _ => Err(ApiError::device_not_found(name)),
        },
        Some(_) => Err(ApiError::invalid_params("name must be a string")),
    }
}

fn entry<T: Serialize>(device: &SharedAdapter, result: Result<T, AdapterError>) -> Value {
    let device_id = device.id().to_string();
    let outcome = result
        .map_err(|e| {
            debug!(device = %device_id, error = %e, "Device operation failed");
            ApiError::from(&e)
        })
        .and_then(|value| serde_json::to_value(value).map_err(|_| ApiError::internal()));
    match outcome {
        Ok(response) => json!({ "device_id": device_id, "response": response }),
        Err(err) => json!({ "device_id": device_id, "error": err.to_value() }),
    }
}

struct CommandMethod;

#[async_trait]
impl ApiMethod for CommandMethod {
    fn name(&self) -> &'static str {
        "sen0395.command"
    }

    fn validate(&self, params: &Value) -> Result<(), ApiError> {
        let command = require_str(params, "command")?;
        if DeviceKind::Sen0395.command_spec(command).is_none() {
            return Err(ApiError::unknown_command(command));
        }
        string_args(params).map(|_| ())
    }

    async fn handle(&self, ctx: &ApiContext, params: &Value) -> Result<Value, ApiError> {
        let command = require_str(params, "command")?;
        let args = string_args(params)?;
        let devices = targets(ctx, DeviceKind::Sen0395, params).await?;
        let responses = join_all(devices.iter().map(|device| {
            let args = &args;
            async move { entry(device, device.send_command(command, args).await) }
        }))
        .await;
        Ok(json!({ "command_responses": responses }))
    }
}

struct ConfigureMethod;

#[async_trait]
impl ApiMethod for ConfigureMethod {
    fn name(&self) -> &'static str {
        "sen0395.configure"
    }

    fn validate(&self, params: &Value) -> Result<(), ApiError> {
        let command = require_str(params, "command")?;
        match DeviceKind::Sen0395.command_spec(command) {
            None => Err(ApiError::unknown_command(command)),
            Some(spec) if !spec.is_config => Err(ApiError::not_config_command(command)),
            Some(_) => string_args(params).map(|_| ()),
        }
    }

    async fn handle(&self, ctx: &ApiContext, params: &Value) -> Result<Value, ApiError> {
        let command = require_str(params, "command")?;
        let args = string_args(params)?;
        let devices = targets(ctx, DeviceKind::Sen0395, params).await?;
        let responses = join_all(devices.iter().map(|device| {
            let args = &args;
            async move { entry(device, device.configure(command, args).await) }
        }))
        .await;
        Ok(json!({ "config_chain_responses": responses }))
    }
}

struct StatusMethod {
    name: &'static str,
    kind: DeviceKind,
}

#[async_trait]
impl ApiMethod for StatusMethod {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn handle(&self, ctx: &ApiContext, params: &Value) -> Result<Value, ApiError> {
        let devices = targets(ctx, self.kind, params).await?;
        let statuses = join_all(
            devices
                .iter()
                .map(|device| async move { entry(device, device.status().await) }),
        )
        .await;
        Ok(json!({ "statuses": statuses }))
    }
}

struct ConfigMethod {
    name: &'static str,
    kind: DeviceKind,
}

#[async_trait]
impl ApiMethod for ConfigMethod {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn handle(&self, ctx: &ApiContext, params: &Value) -> Result<Value, ApiError> {
        let devices = targets(ctx, self.kind, params).await?;
        let configs = join_all(
            devices
                .iter()
                .map(|device| async move { entry(device, device.config().await) }),
        )
        .await;
        Ok(json!({ "configs": configs }))
    }
}

/// Start or stop the continuous reading loop
struct ReadingMethod {
    name: &'static str,
    kind: DeviceKind,
}

impl ReadingMethod {
    fn enabled(params: &Value) -> Result<bool, ApiError> {
        match params.get("enabled") {
            Some(Value::Bool(b)) => Ok(*b),
            Some(Value::Null) | None => Err(ApiError::missing_field("enabled")),
            Some(_) => Err(ApiError::invalid_params("enabled must be a boolean")),
        }
    }
}

#[async_trait]
impl ApiMethod for ReadingMethod {
    fn name(&self) -> &'static str {
        self.name
    }

    fn validate(&self, params: &Value) -> Result<(), ApiError> {
        Self::enabled(params).map(|_| ())
    }

    async fn handle(&self, ctx: &ApiContext, params: &Value) -> Result<Value, ApiError> {
        let enabled = Self::enabled(params)?;
        let devices = targets(ctx, self.kind, params).await?;
        let responses = join_all(devices.iter().map(|device| async move {
            let result = if enabled {
                match device.clear_buffer().await {
                    Ok(()) => device.start_reading().await,
                    Err(e) => Err(e),
                }
            } else {
                device.stop_reading().await
            };
            entry(device, result.map(|()| json!({ "reading": enabled })))
        }))
        .await;
        Ok(json!({ "reading_responses": responses }))
    }
}

/// `on`/`off`/`toggle` for the relay named in `args[0]`
struct RelayCommandMethod;

#[async_trait]
impl ApiMethod for RelayCommandMethod {
    fn name(&self) -> &'static str {
        "rpio.command"
    }

    fn validate(&self, params: &Value) -> Result<(), ApiError> {
        let command = require_str(params, "command")?;
        if RelayCommand::from_value(command).is_none() {
            return Err(ApiError::unknown_command(command));
        }
        if string_args(params)?.is_empty() {
            return Err(ApiError::missing_field("args"));
        }
        Ok(())
    }

    async fn handle(&self, ctx: &ApiContext, params: &Value) -> Result<Value, ApiError> {
        let command = require_str(params, "command")?;
        let args = string_args(params)?;
        let devices = targets(ctx, DeviceKind::Rpio, params).await?;
        let responses = join_all(devices.iter().map(|device| {
            let args = &args;
            async move { entry(device, device.send_command(command, args).await) }
        }))
        .await;
        Ok(json!({ "command_responses": responses }))
    }
}

/// Routes requests to methods; one instance serves one registry
pub struct Dispatcher {
    ctx: ApiContext,
    methods: HashMap<&'static str, Arc<dyn ApiMethod>>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>) -> Self {
        let methods: Vec<Arc<dyn ApiMethod>> = vec![
            Arc::new(CommandMethod),
            Arc::new(ConfigureMethod),
            Arc::new(StatusMethod {
                name: "sen0395.status",
                kind: DeviceKind::Sen0395,
            }),
            Arc::new(ConfigMethod {
                name: "sen0395.config",
                kind: DeviceKind::Sen0395,
            }),
            Arc::new(ReadingMethod {
                name: "sen0395.reading",
                kind: DeviceKind::Sen0395,
            }),
            Arc::new(StatusMethod {
                name: "sen0311.status",
                kind: DeviceKind::Sen0311,
            }),
            Arc::new(ReadingMethod {
                name: "sen0311.reading",
                kind: DeviceKind::Sen0311,
            }),
            Arc::new(StatusMethod {
                name: "rpio.status",
                kind: DeviceKind::Rpio,
            }),
            Arc::new(RelayCommandMethod),
        ];

        Self {
            ctx: ApiContext { registry },
            methods: methods.into_iter().map(|m| (m.name(), m)).collect(),
        }
    }

    /// Registered method names, sorted
    pub fn methods(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.methods.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub async fn dispatch(&self, raw: &str) -> ResponseEnvelope {
        let request: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "Unparseable request");
                return ResponseEnvelope::error(Value::Null, ErrorObject::parse_error());
            }
        };
        let id = request.get("id").cloned().unwrap_or(Value::Null);

        let Some(object) = request.as_object() else {
            return ResponseEnvelope::error(id, ErrorObject::invalid_request("request must be an object"));
        };
        if object.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
            return ResponseEnvelope::error(
                id,
                ErrorObject::invalid_request(format!("jsonrpc must be \"{}\"", JSONRPC_VERSION)),
            );
        }
        let Some(method_name) = object.get("method").and_then(Value::as_str) else {
            return ResponseEnvelope::error(id, ErrorObject::invalid_request("missing method"));
        };
        let Some(method) = self.methods.get(method_name) else {
            return ResponseEnvelope::error(id, ErrorObject::method_not_found(method_name));
        };

        let params = match object.get("params") {
            None | Some(Value::Null) => Value::Object(Default::default()),
            Some(p @ Value::Object(_)) => p.clone(),
            Some(_) => {
                return ResponseEnvelope::error(
                    id,
                    ErrorObject::invalid_params("params must be an object"),
                )
            }
        };

        if let Err(e) = method.validate(&params) {
            return ResponseEnvelope::error(id, e.into());
        }

        debug!(method = method_name, "Dispatching request");
        let outcome = AssertUnwindSafe(method.handle(&self.ctx, &params))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(result)) => ResponseEnvelope::success(id, result),
            Ok(Err(e)) => {
                if e.code == codes::INTERNAL_ERROR {
                    error!(method = method_name, error = %e.message, "Method failed");
                }
                ResponseEnvelope::error(id, e.into())
            }
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(method = method_name, panic = %detail, "Method panicked");
                ResponseEnvelope::error(id, ErrorObject::internal_error())
            }
        }
    }
}

#[async_trait]
impl Handler for Dispatcher {
    async fn handle(&self, request: String) -> Option<String> {
        let response = self.dispatch(&request).await;
        match response.to_json() {
            Ok(json) => Some(json),
            Err(e) => {
                error!(error = %e, "Failed to serialize response");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::testing::FakeDevice;

    async fn dispatcher(devices: Vec<FakeDevice>) -> Dispatcher {
        let registry = Arc::new(Registry::new());
        for device in devices {
            registry.register(Arc::new(device)).await.unwrap();
        }
        Dispatcher::new(registry)
    }

    async fn call(d: &Dispatcher, request: Value) -> ResponseEnvelope {
        d.dispatch(&request.to_string()).await
    }

    fn code(resp: &ResponseEnvelope) -> i64 {
        resp.error.as_ref().map(|e| e.code).unwrap_or_default()
    }

    #[tokio::test]
    async fn test_unknown_method_echoes_id() {
        let d = dispatcher(vec![]).await;
        let resp = call(&d, json!({"jsonrpc": "2.0", "method": "sen9999.status", "id": 42})).await;
        assert_eq!(code(&resp), codes::METHOD_NOT_FOUND);
        assert_eq!(resp.id, json!(42));
    }

    #[tokio::test]
    async fn test_parse_error_has_null_id() {
        let d = dispatcher(vec![]).await;
        let resp = d.dispatch("{not json").await;
        assert_eq!(code(&resp), codes::PARSE_ERROR);
        assert_eq!(resp.id, Value::Null);
    }

    #[tokio::test]
    async fn test_invalid_request() {
        let d = dispatcher(vec![]).await;
        let resp = call(&d, json!({"jsonrpc": "1.0", "method": "rpio.status", "id": "x"})).await;
        assert_eq!(code(&resp), codes::INVALID_REQUEST);
        assert_eq!(resp.id, json!("x"));

        let resp = call(&d, json!({"jsonrpc": "2.0", "id": 1})).await;
        assert_eq!(code(&resp), codes::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn test_device_not_found_vs_no_devices() {
        let d = dispatcher(vec![]).await;
        let resp = call(&d, json!({"jsonrpc": "2.0", "method": "sen0395.status", "id": 1})).await;
        assert_eq!(code(&resp), codes::NO_DEVICES);

        let d = dispatcher(vec![FakeDevice::new(DeviceKind::Sen0395, "hall")]).await;
        let resp = call(
            &d,
            json!({"jsonrpc": "2.0", "method": "sen0395.status", "params": {"name": "attic"}, "id": 2}),
        )
        .await;
        assert_eq!(code(&resp), codes::DEVICE_NOT_FOUND);
        assert_eq!(resp.error.unwrap().message, "Device attic not found");
    }

    #[tokio::test]
    async fn test_name_of_other_kind_is_not_found() {
        let d = dispatcher(vec![FakeDevice::new(DeviceKind::Sen0311, "door")]).await;
        let resp = call(
            &d,
            json!({"jsonrpc": "2.0", "method": "sen0395.status", "params": {"name": "door"}, "id": 1}),
        )
        .await;
        assert_eq!(code(&resp), codes::DEVICE_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_status_of_all_devices() {
        let d = dispatcher(vec![
            FakeDevice::new(DeviceKind::Sen0395, "b"),
            FakeDevice::new(DeviceKind::Sen0395, "a"),
            FakeDevice::new(DeviceKind::Rpio, "board"),
        ])
        .await;
        let resp = call(&d, json!({"jsonrpc": "2.0", "method": "sen0395.status", "id": 1})).await;
        let statuses = resp.result.unwrap()["statuses"].as_array().unwrap().clone();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0]["device_id"], "sen0395/a");
        assert_eq!(statuses[0]["response"]["reading"], false);
    }

    #[tokio::test]
    async fn test_command_validation() {
        let d = dispatcher(vec![FakeDevice::new(DeviceKind::Sen0395, "hall")]).await;

        let resp = call(&d, json!({"jsonrpc": "2.0", "method": "sen0395.command", "id": 1})).await;
        assert_eq!(code(&resp), codes::INVALID_PARAMS);
        assert_eq!(resp.error.unwrap().message, "Missing field: command");

        let resp = call(
            &d,
            json!({"jsonrpc": "2.0", "method": "sen0395.command", "params": {"command": "fly"}, "id": 2}),
        )
        .await;
        assert_eq!(code(&resp), codes::UNKNOWN_COMMAND);

        let resp = call(
            &d,
            json!({"jsonrpc": "2.0", "method": "sen0395.configure", "params": {"command": "sensorStart"}, "id": 3}),
        )
        .await;
        assert_eq!(code(&resp), codes::NOT_CONFIG_COMMAND);
    }

    #[tokio::test]
    async fn test_command_outcomes() {
        let d = dispatcher(vec![FakeDevice::new(DeviceKind::Sen0395, "hall")]).await;
        let resp = call(
            &d,
            json!({"jsonrpc": "2.0", "method": "sen0395.command", "params": {"command": "sensorStart"}, "id": 1}),
        )
        .await;
        let responses = &resp.result.unwrap()["command_responses"];
        assert_eq!(responses[0]["device_id"], "sen0395/hall");
        assert_eq!(responses[0]["response"]["result"], "done");
    }

    #[tokio::test]
    async fn test_configure_error_per_device() {
        // FakeDevice keeps the default configure, which rejects every command
        let d = dispatcher(vec![FakeDevice::new(DeviceKind::Sen0395, "hall")]).await;
        let resp = call(
            &d,
            json!({"jsonrpc": "2.0", "method": "sen0395.configure",
                   "params": {"command": "outputLatency", "args": [0, 5]}, "id": 1}),
        )
        .await;
        let responses = &resp.result.unwrap()["config_chain_responses"];
        assert_eq!(responses[0]["error"]["code"], codes::NOT_CONFIG_COMMAND);
    }

    #[tokio::test]
    async fn test_reading_toggles_device() {
        let d = dispatcher(vec![FakeDevice::new(DeviceKind::Sen0311, "door")]).await;

        let resp = call(&d, json!({"jsonrpc": "2.0", "method": "sen0311.reading", "id": 1})).await;
        assert_eq!(resp.error.unwrap().message, "Missing field: enabled");

        let resp = call(
            &d,
            json!({"jsonrpc": "2.0", "method": "sen0311.reading", "params": {"enabled": true}, "id": 2}),
        )
        .await;
        assert_eq!(resp.result.unwrap()["reading_responses"][0]["response"]["reading"], true);

        let device = d.ctx.registry.get("door").await.unwrap();
        assert!(device.status().await.unwrap().reading);
    }

    #[tokio::test]
    async fn test_relay_command_requires_relay() {
        let d = dispatcher(vec![FakeDevice::new(DeviceKind::Rpio, "board")]).await;
        let resp = call(
            &d,
            json!({"jsonrpc": "2.0", "method": "rpio.command", "params": {"command": "toggle"}, "id": 1}),
        )
        .await;
        assert_eq!(resp.error.unwrap().message, "Missing field: args");

        let resp = call(
            &d,
            json!({"jsonrpc": "2.0", "method": "rpio.command",
                   "params": {"command": "toggle", "args": ["lamp"]}, "id": 2}),
        )
        .await;
        assert!(!resp.is_error());
    }

    #[tokio::test]
    async fn test_panic_becomes_internal_error() {
        let d = dispatcher(vec![FakeDevice::new(DeviceKind::Rpio, "board").panicking_status()]).await;
        let resp = call(&d, json!({"jsonrpc": "2.0", "method": "rpio.status", "id": 9})).await;
        assert_eq!(code(&resp), codes::INTERNAL_ERROR);
        assert_eq!(resp.id, json!(9));
    }

    #[tokio::test]
    async fn test_handler_returns_json() {
        let d = dispatcher(vec![]).await;
        let reply = Handler::handle(&d, r#"{"jsonrpc":"2.0","method":"nope","id":1}"#.to_string())
            .await
            .unwrap();
        let value: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(value["error"]["code"], codes::METHOD_NOT_FOUND);
    }

    #[test]
    fn test_method_table() {
        let d = Dispatcher::new(Arc::new(Registry::new()));
        assert_eq!(
            d.methods(),
            vec![
                "rpio.command",
                "rpio.status",
                "sen0311.reading",
                "sen0311.status",
                "sen0395.command",
                "sen0395.config",
                "sen0395.configure",
                "sen0395.reading",
                "sen0395.status",
            ]
        );
    }
}
