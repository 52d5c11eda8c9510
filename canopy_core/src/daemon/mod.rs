/*
    The daemon supervises the input controllers: it starts one per
    activated input, restarts them on reconfiguration and routes
    conditional changes to the controller that owns them.
*/
use crate::cfg::{ConditionalConfig, ConfigError, DaemonConfig, InputChannelConfig};
use crate::conditional::ConditionalTable;
use crate::core::broadcast_channel::GenericSender;
use crate::core::channel_manager::ChannelManager;
use crate::core::SystemMessage;
use crate::driver::registry::DriverRegistry;
use crate::input::pause::PauseTimeout;
use crate::input::{ControllerError, ControllerHandle, ControllerServices, ControllerSettings, ControllerStatus, InputController};
use crate::trace::trace_helper::TraceHelper;
use crate::util::{JsonStorage, ObjectStorage, StorageError};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError
{
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Controller(#[from] ControllerError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Pause(#[from] PauseTimeout),
    #[error("unknown input {0}")]
    UnknownInput(String),
    #[error("unknown conditional {0}")]
    UnknownConditional(String),
    #[error("conditional {0} already exists")]
    DuplicateConditional(String)
}

/// # Daemon
/// Owns the running controllers. All operations are synchronous: when
/// they return, the controller was started, stopped or has its new
/// conditional table.
pub struct Daemon
{
    config: DaemonConfig,
    config_path: Option<PathBuf>,
    registry: DriverRegistry,
    services: ControllerServices,
    settings: ControllerSettings,
    conditionals: JsonStorage<ConditionalConfig>,
    controllers: BTreeMap<String, ControllerHandle>,
    system_events: GenericSender<SystemMessage>,
    tracer: TraceHelper
}

impl Daemon
{
    /// Starts a controller for every activated input. An input that
    /// cannot be started is logged and skipped; the others run.
    pub fn start(config: DaemonConfig, registry: DriverRegistry, services: ControllerServices, chm: &ChannelManager) -> Result<Self, DaemonError>
    {
        config.validate()?;
        let conditionals: JsonStorage<ConditionalConfig> = JsonStorage::load(&config.conditionals_path)?;
        for cond in conditionals.iter()
        {
            cond.validate()?;
        }

        let mut daemon = Daemon {
            settings: ControllerSettings::from_daemon(&config),
            config,
            config_path: None,
            registry,
            services,
            conditionals,
            controllers: BTreeMap::new(),
            system_events: chm.get_sender(),
            tracer: TraceHelper::new("SYS/Daemon".to_string())
        };

        daemon.tracer.info(format!("Starting {} input(s)", daemon.config.inputs.len()));
        let ids: Vec<String> = daemon.config
                                     .inputs
                                     .iter()
                                     .filter(|i| i.is_activated)
                                     .map(|i| i.unique_id.clone())
                                     .collect();
        for id in ids
        {
            if let Err(e) = daemon.start_input(&id)
            {
                daemon.tracer.error_chain(&format!("Input {} not started", id), &e);
            }
        }
        Ok(daemon)
    }

    /// Like `start`, but remembers where the configuration came from so
    /// `reconfigure_input` picks up changes made to the file.
    pub fn from_file(path: impl AsRef<Path>, registry: DriverRegistry, services: ControllerServices, chm: &ChannelManager) -> Result<Self, DaemonError>
    {
        let config = DaemonConfig::load(path.as_ref())?;
        let mut daemon = Self::start(config, registry, services, chm)?;
        daemon.config_path = Some(path.as_ref().to_path_buf());
        Ok(daemon)
    }

    pub fn config(&self) -> &DaemonConfig
    {
        &self.config
    }

    pub fn running_inputs(&self) -> Vec<String>
    {
        self.controllers.keys().cloned().collect()
    }

    pub fn status(&self, input_id: &str) -> Option<ControllerStatus>
    {
        self.controllers.get(input_id).map(|c| c.status())
    }

    /// Size of the conditional table the input's controller works with.
    pub fn conditional_count(&self, input_id: &str) -> Option<usize>
    {
        self.controllers.get(input_id).map(|c| c.conditional_count())
    }

    pub fn conditionals(&self) -> Vec<ConditionalConfig>
    {
        self.conditionals.entries()
    }

    fn input_config(&self, input_id: &str) -> Result<InputChannelConfig, DaemonError>
    {
        self.config
            .input(input_id)
            .cloned()
            .ok_or_else(|| DaemonError::UnknownInput(input_id.to_string()))
    }

    /// Starts the controller of one input. Starting a running input does
    /// nothing.
    pub fn start_input(&mut self, input_id: &str) -> Result<(), DaemonError>
    {
        if self.controllers.contains_key(input_id)
        {
            return Ok(());
        }
        let cfg = self.input_config(input_id)?;
        let table = ConditionalTable::rebuild(&cfg.unique_id, cfg.display_name(), &self.conditionals.entries());
        let controller = InputController::new(cfg,
                                              table,
                                              &self.registry,
                                              self.services.clone(),
                                              self.settings.clone())?;
        let handle = controller.launch()?;
        self.controllers.insert(input_id.to_string(), handle);
        self.system_events.send(SystemMessage::InputStarted(input_id.to_string()));
        self.tracer.info(format!("Input {} started", input_id));
        Ok(())
    }

    /// Stops the controller of one input and waits for its thread.
    pub fn stop_input(&mut self, input_id: &str) -> Result<(), DaemonError>
    {
        let mut handle = self.controllers
                             .remove(input_id)
                             .ok_or_else(|| DaemonError::UnknownInput(input_id.to_string()))?;
        handle.stop();
        if let Err(message) = handle.join()
        {
            self.tracer.error(format!("Controller of input {} panicked: {}", input_id, message));
        }
        self.system_events.send(SystemMessage::InputStopped(input_id.to_string()));
        self.tracer.info(format!("Input {} stopped", input_id));
        Ok(())
    }

    /// Replaces the input's configuration snapshot with a fresh one and
    /// restarts its controller. The snapshot is reloaded from the config
    /// file if the daemon was started from one.
    pub fn reconfigure_input(&mut self, input_id: &str) -> Result<(), DaemonError>
    {
        if let Some(path) = &self.config_path
        {
            let fresh = DaemonConfig::load(path)?;
            self.config.inputs.retain(|i| i.unique_id != input_id);
            if let Some(cfg) = fresh.input(input_id)
            {
                self.config.inputs.push(cfg.clone());
            }
        }
        self.restart_input(input_id)
    }

    /// Installs a new configuration for one input and restarts it.
    pub fn replace_input(&mut self, cfg: InputChannelConfig) -> Result<(), DaemonError>
    {
        cfg.validate()?;
        let id = cfg.unique_id.clone();
        match self.config.inputs.iter_mut().find(|i| i.unique_id == id)
        {
            Some(slot) => *slot = cfg,
            None => self.config.inputs.push(cfg)
        }
        self.restart_input(&id)
    }

    fn restart_input(&mut self, input_id: &str) -> Result<(), DaemonError>
    {
        if self.controllers.contains_key(input_id)
        {
            self.stop_input(input_id)?;
        }
        match self.config.input(input_id)
        {
            Some(cfg) if cfg.is_activated => self.start_input(input_id),
            Some(_) => Ok(()),
            None => Err(DaemonError::UnknownInput(input_id.to_string()))
        }
    }

    pub fn force_measurement(&self, input_id: &str) -> Result<(), DaemonError>
    {
        self.controllers
            .get(input_id)
            .map(|c| c.force_measurement())
            .ok_or_else(|| DaemonError::UnknownInput(input_id.to_string()))
    }

    pub fn add_conditional(&mut self, cfg: ConditionalConfig) -> Result<(), DaemonError>
    {
        cfg.validate()?;
        if self.conditionals.get_entry(|c| c.unique_id == cfg.unique_id).is_some()
        {
            return Err(DaemonError::DuplicateConditional(cfg.unique_id));
        }
        let input_id = cfg.input_id.clone();
        self.conditionals.put_entry(cfg);
        self.conditionals.update_storage()?;
        self.rebuild_conditionals(&input_id)
    }

    pub fn remove_conditional(&mut self, conditional_id: &str) -> Result<(), DaemonError>
    {
        let existing = self.conditionals
                           .get_entry(|c| c.unique_id == conditional_id)
                           .ok_or_else(|| DaemonError::UnknownConditional(conditional_id.to_string()))?;
        self.conditionals.delete_entry(|c| c.unique_id == conditional_id);
        self.conditionals.update_storage()?;
        self.rebuild_conditionals(&existing.input_id)
    }

    pub fn modify_conditional(&mut self, cfg: ConditionalConfig) -> Result<(), DaemonError>
    {
        cfg.validate()?;
        let id = cfg.unique_id.clone();
        let existing = self.conditionals
                           .get_entry(|c| c.unique_id == id)
                           .ok_or_else(|| DaemonError::UnknownConditional(id.clone()))?;
        let input_id = cfg.input_id.clone();
        self.conditionals.replace_entry(|c| c.unique_id == id, cfg);
        self.conditionals.update_storage()?;

        if existing.input_id != input_id
        {
            self.rebuild_conditionals(&existing.input_id)?;
        }
        self.rebuild_conditionals(&input_id)
    }

    /// Full rebuild of one input's table from the persisted list. Inputs
    /// without a running controller pick the change up when they start.
    fn rebuild_conditionals(&self, input_id: &str) -> Result<(), DaemonError>
    {
        if let Some(handle) = self.controllers.get(input_id)
        {
            handle.rebuild_conditionals(&self.conditionals.entries())?;
            self.tracer.debug(format!("Conditionals of {} rebuilt, {} active", input_id, handle.conditional_count()));
        }
        Ok(())
    }

    /// Stops every controller, then tells the remaining threads (outputs,
    /// persistence) to finish.
    pub fn shutdown(&mut self)
    {
        self.tracer.info("Shutting down");
        for handle in self.controllers.values()
        {
            handle.stop();
        }
        let ids: Vec<String> = self.controllers.keys().cloned().collect();
        for id in ids
        {
            let _ = self.stop_input(&id);
        }
        self.system_events.send(SystemMessage::Shutdown);
    }
}
