//! systemd unit inspection and control
//!
//! Units are driven over the manager's private bus socket, reached through
//! the session's tunnel. Status comes from the unit's
//! `org.freedesktop.systemd1.Unit` properties.

use crate::files::RemoteShell;
use crate::{FleetlinkError, Result};
use fleetlink_proto::{BusConnection, ProtocolError, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const DESTINATION: &str = "org.freedesktop.systemd1";
const MANAGER_PATH: &str = "/org/freedesktop/systemd1";
const MANAGER_INTERFACE: &str = "org.freedesktop.systemd1.Manager";
const UNIT_INTERFACE: &str = "org.freedesktop.systemd1.Unit";
const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

/// Job mode for start, stop and restart
const JOB_MODE: &str = "replace";

/// Command used to reload unit files
pub const RELOAD_COMMAND: &str = "systemctl daemon-reload";

/// Operations on units, used for error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceOperation {
    /// Read unit status
    Get,
    /// Start a unit
    Start,
    /// Stop a unit
    Stop,
    /// Reload or restart a unit
    Restart,
    /// Enable a unit file
    Enable,
    /// Disable a unit file
    Disable,
    /// Reload the manager configuration
    Reload,
}

impl ServiceOperation {
    /// Machine-readable problem type
    pub fn problem_type(self) -> &'static str {
        match self {
            ServiceOperation::Get => "systemd_get_service",
            ServiceOperation::Start => "systemd_start_service",
            ServiceOperation::Stop => "systemd_stop_service",
            ServiceOperation::Restart => "systemd_restart_service",
            ServiceOperation::Enable => "systemd_enable_service",
            ServiceOperation::Disable => "systemd_disable_service",
            ServiceOperation::Reload => "systemd_reload",
        }
    }

    /// Short human-readable title
    pub fn title(self) -> &'static str {
        match self {
            ServiceOperation::Get => "Systemd services detail error",
            ServiceOperation::Start => "Starting systemd service failed",
            ServiceOperation::Stop => "Stopping systemd service failed",
            ServiceOperation::Restart => "Restarting systemd service failed",
            ServiceOperation::Enable => "Enabling systemd service failed",
            ServiceOperation::Disable => "Disabling systemd service failed",
            ServiceOperation::Reload => "Reloading systemd services failed",
        }
    }
}

impl fmt::Display for ServiceOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self {
            ServiceOperation::Get => "inspect",
            ServiceOperation::Start => "start",
            ServiceOperation::Stop => "stop",
            ServiceOperation::Restart => "restart",
            ServiceOperation::Enable => "enable",
            ServiceOperation::Disable => "disable",
            ServiceOperation::Reload => "reload",
        };
        f.write_str(verb)
    }
}

/// Status of one unit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    /// Unit name
    pub title: String,
    /// Unit description
    pub description: String,
    /// Unit file path
    pub path: String,
    /// Unit file state is `enabled`
    pub is_enabled: bool,
    /// Active state is `active`
    pub is_active: bool,
    /// Sub state is `running`
    pub is_running: bool,
    /// Active state is `failed`
    pub is_failed: bool,
    /// Active state is a transition
    pub is_loading: bool,
    /// `loaded`, `error`, `masked`, ...
    pub load_state: String,
    /// `active`, `reloading`, `inactive`, `failed`, `activating`, `deactivating`
    pub active_state: String,
    /// Unit-type specific state
    pub sub_state: String,
}

impl ServiceStatus {
    /// Project a unit's property map. Missing properties read as empty.
    pub fn from_properties(properties: &HashMap<String, Value>) -> Self {
        let text = |name: &str| {
            properties
                .get(name)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };

        let active_state = text("ActiveState");
        let sub_state = text("SubState");
        Self {
            title: text("Id"),
            description: text("Description"),
            path: text("FragmentPath"),
            is_enabled: text("UnitFileState") == "enabled",
            is_active: active_state == "active",
            is_running: sub_state == "running",
            is_failed: active_state == "failed",
            is_loading: matches!(
                active_state.as_str(),
                "reloading" | "activating" | "deactivating"
            ),
            load_state: text("LoadState"),
            active_state,
            sub_state,
        }
    }
}

/// Unit control over a service manager bus connection
pub struct ServiceManager<S> {
    bus: Arc<BusConnection<S>>,
}

impl<S> ServiceManager<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an established bus connection
    pub fn new(bus: Arc<BusConnection<S>>) -> Self {
        Self { bus }
    }

    /// Load `name` and read its status
    pub async fn get_service(&self, name: &str) -> Result<ServiceStatus> {
        check_unit_name(name)?;
        debug!("Getting systemd service {}", name);

        let reply = self
            .manager_call(ServiceOperation::Get, name, "LoadUnit", vec![name.into()])
            .await?;
        let unit_path = reply
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| malformed(ServiceOperation::Get, name, "LoadUnit"))?
            .to_string();

        let reply = self
            .bus
            .call_method(
                DESTINATION,
                &unit_path,
                PROPERTIES_INTERFACE,
                "GetAll",
                vec![UNIT_INTERFACE.into()],
            )
            .await
            .map_err(|e| service_error(ServiceOperation::Get, name, e))?;
        let properties = reply
            .into_iter()
            .next()
            .and_then(Value::into_property_map)
            .ok_or_else(|| malformed(ServiceOperation::Get, name, "GetAll"))?;

        Ok(ServiceStatus::from_properties(&properties))
    }

    /// Start `name`
    pub async fn start(&self, name: &str) -> Result<()> {
        check_unit_name(name)?;
        info!("Starting service {}", name);
        self.manager_call(
            ServiceOperation::Start,
            name,
            "StartUnit",
            vec![name.into(), JOB_MODE.into()],
        )
        .await?;
        Ok(())
    }

    /// Stop `name`
    pub async fn stop(&self, name: &str) -> Result<()> {
        check_unit_name(name)?;
        info!("Stopping service {}", name);
        self.manager_call(
            ServiceOperation::Stop,
            name,
            "StopUnit",
            vec![name.into(), JOB_MODE.into()],
        )
        .await?;
        Ok(())
    }

    /// Reload `name` if it supports reloading, restart it otherwise
    pub async fn restart(&self, name: &str) -> Result<()> {
        check_unit_name(name)?;
        info!("Restarting service {}", name);
        self.manager_call(
            ServiceOperation::Restart,
            name,
            "ReloadOrRestartUnit",
            vec![name.into(), JOB_MODE.into()],
        )
        .await?;
        Ok(())
    }

    /// Enable the unit file of `name`, then reload the manager
    pub async fn enable(&self, name: &str) -> Result<()> {
        check_unit_name(name)?;
        info!("Enabling service {}", name);
        // runtime = false, force = false
        self.manager_call(
            ServiceOperation::Enable,
            name,
            "EnableUnitFiles",
            vec![Value::string_array([name]), false.into(), false.into()],
        )
        .await?;
        self.reload_manager(ServiceOperation::Enable, name).await
    }

    /// Disable the unit file of `name`, then reload the manager
    pub async fn disable(&self, name: &str) -> Result<()> {
        check_unit_name(name)?;
        info!("Disabling service {}", name);
        // runtime = false
        self.manager_call(
            ServiceOperation::Disable,
            name,
            "DisableUnitFiles",
            vec![Value::string_array([name]), false.into()],
        )
        .await?;
        self.reload_manager(ServiceOperation::Disable, name).await
    }

    async fn reload_manager(&self, operation: ServiceOperation, unit: &str) -> Result<()> {
        debug!("Reloading systemd after {} {}", operation, unit);
        self.manager_call(operation, unit, "Reload", Vec::new())
            .await?;
        Ok(())
    }

    async fn manager_call(
        &self,
        operation: ServiceOperation,
        unit: &str,
        member: &str,
        body: Vec<Value>,
    ) -> Result<Vec<Value>> {
        self.bus
            .call_method(DESTINATION, MANAGER_PATH, MANAGER_INTERFACE, member, body)
            .await
            .map_err(|e| service_error(operation, unit, e))
    }
}

/// Reload unit files with `systemctl daemon-reload`.
///
/// A nonzero exit fails with the command's standard error.
pub async fn reload<R>(shell: &R, cancel: &CancellationToken) -> Result<()>
where
    R: RemoteShell + ?Sized,
{
    info!("Reloading systemd");
    let result = shell
        .run(RELOAD_COMMAND, cancel)
        .await
        .map_err(|source| FleetlinkError::Command {
            command: RELOAD_COMMAND.to_string(),
            source,
        })?;

    if !result.success() {
        let message = match result.error {
            Some(marker) => marker,
            None => result.stderr_lossy().trim().to_string(),
        };
        return Err(FleetlinkError::Service {
            operation: ServiceOperation::Reload,
            unit: "systemd".to_string(),
            message,
        });
    }
    Ok(())
}

fn check_unit_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(FleetlinkError::InvalidRequest(
            "unit name is required".to_string(),
        ));
    }
    Ok(())
}

fn service_error(operation: ServiceOperation, unit: &str, error: ProtocolError) -> FleetlinkError {
    let message = match error {
        ProtocolError::MethodError { message, .. } => message,
        other => other.to_string(),
    };
    FleetlinkError::Service {
        operation,
        unit: unit.to_string(),
        message,
    }
}

fn malformed(operation: ServiceOperation, unit: &str, member: &str) -> FleetlinkError {
    FleetlinkError::Service {
        operation,
        unit: unit.to_string(),
        message: format!("unexpected {member} reply"),
    }
}
