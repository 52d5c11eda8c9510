/*
    Conditional evaluation. Each input controller owns one table of the
    conditionals bound to it. The table is rebuilt as a whole whenever a
    conditional is added, removed or modified, and only while the owning
    loop is paused.
*/
use crate::cfg::{seconds, ConditionalConfig, ConditionalMode, EdgeDirection, SignalSelect};
use crate::core::broadcast_channel::GenericSender;
use crate::core::channel_manager::ChannelManager;
use crate::core::SystemMessage;
use crate::trace::trace_helper::TraceHelper;
use canopy_hal::gpio::Level;
use chrono::{DateTime, Utc};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Clone, Debug, PartialEq)]
pub enum EntryMode
{
    Periodic { period: Duration },
    Edge { signal_select: SignalSelect, edge_direction: EdgeDirection }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ConditionalEntry
{
    pub unique_id: String,
    pub name: String,
    pub action: String,
    pub mode: EntryMode,
    /// Earliest time a periodic entry may be evaluated again. Unset until
    /// the entry fired once.
    pub next_eval: Option<Instant>
}

impl ConditionalEntry
{
    pub fn from_config(cfg: &ConditionalConfig) -> Self
    {
        let mode = match &cfg.mode
        {
            ConditionalMode::Periodic { period } => EntryMode::Periodic { period: seconds(*period) },
            ConditionalMode::Edge { signal_select, edge_direction } => EntryMode::Edge {
                signal_select: *signal_select,
                edge_direction: *edge_direction
            }
        };
        ConditionalEntry {
            unique_id: cfg.unique_id.clone(),
            name: cfg.name.clone(),
            action: cfg.action.clone(),
            mode,
            next_eval: None
        }
    }
}

/// A fired conditional, handed to the action dispatcher.
#[derive(Clone, Debug, PartialEq)]
pub struct ConditionalTrigger
{
    pub conditional_id: String,
    pub action: String,
    pub input_id: String,
    pub message: String,
    pub edge: Option<EdgeDirection>,
    pub timestamp: DateTime<Utc>
}

/// Runs the action of a fired conditional. Must not block the caller.
#[cfg_attr(test, mockall::automock)]
pub trait ActionDispatch: Send + Sync
{
    fn dispatch(&self, trigger: ConditionalTrigger);
}

/// `ActionDispatch` that publishes triggers on the channel manager.
#[derive(Clone)]
pub struct ConditionalBus
{
    triggers: GenericSender<ConditionalTrigger>
}

impl ConditionalBus
{
    pub fn new(chm: &ChannelManager) -> Self
    {
        ConditionalBus { triggers: chm.get_sender() }
    }
}

impl ActionDispatch for ConditionalBus
{
    fn dispatch(&self, trigger: ConditionalTrigger)
    {
        self.triggers.send(trigger);
    }
}

/// Spawns the action log: every trigger published on the bus is logged
/// with its action id. Targets without a real action executor run this.
pub fn launch_action_log(chm: &ChannelManager) -> std::io::Result<thread::JoinHandle<()>>
{
    let tracer = TraceHelper::new("COND/Actions".to_string());
    let triggers = chm.get_receiver::<ConditionalTrigger>();
    let system_events = chm.get_receiver::<SystemMessage>();
    thread::Builder::new().name("actions".to_string()).spawn(move || {
        loop
        {
            if let Some(SystemMessage::Shutdown) = system_events.try_receive()
            {
                break;
            }
            if let Some(trigger) = triggers.receive_with_timeout(Duration::from_millis(100))
            {
                tracer.info(format!("{} -> action {}", trigger.message, trigger.action));
            }
        }
    })
}

/// # ConditionalTable
/// The active conditionals of one input.
#[derive(Clone, Debug, Default)]
pub struct ConditionalTable
{
    input_id: String,
    input_name: String,
    entries: Vec<ConditionalEntry>
}

impl ConditionalTable
{
    pub fn empty(input_id: &str, input_name: &str) -> Self
    {
        ConditionalTable {
            input_id: input_id.to_string(),
            input_name: input_name.to_string(),
            entries: Vec::new()
        }
    }

    /// Builds the table from the full persisted conditional list, keeping
    /// the activated entries bound to `input_id`.
    pub fn rebuild(input_id: &str, input_name: &str, configs: &[ConditionalConfig]) -> Self
    {
        let mut table = Self::empty(input_id, input_name);
        table.entries = configs.iter()
                               .filter(|c| c.input_id == input_id && c.is_activated)
                               .map(ConditionalEntry::from_config)
                               .collect();
        table
    }

    pub fn entries(&self) -> &[ConditionalEntry]
    {
        &self.entries
    }

    pub fn len(&self) -> usize
    {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.entries.is_empty()
    }

    pub fn has_periodic(&self) -> bool
    {
        self.entries.iter().any(|e| matches!(e.mode, EntryMode::Periodic { .. }))
    }

    fn header(&self, entry: &ConditionalEntry) -> String
    {
        format!("[Conditional {} ({})] Input {} ({})",
                entry.unique_id, entry.name, self.input_id, self.input_name)
    }

    /// Fires every periodic entry that is either pending for its first
    /// run after a measurement or past its next evaluation time.
    pub fn evaluate_periodic(&mut self, now: Instant, trigger_pending: bool) -> Vec<ConditionalTrigger>
    {
        let mut fired = Vec::new();
        for i in 0..self.entries.len()
        {
            let period = match self.entries[i].mode
            {
                EntryMode::Periodic { period } => period,
                EntryMode::Edge { .. } => continue
            };
            let due = match self.entries[i].next_eval
            {
                None => trigger_pending,
                Some(next) => now >= next
            };
            if !due
            {
                continue;
            }

            self.entries[i].next_eval = Some(now + period);
            let entry = &self.entries[i];
            fired.push(ConditionalTrigger {
                conditional_id: entry.unique_id.clone(),
                action: entry.action.clone(),
                input_id: self.input_id.clone(),
                message: format!("{} periodic evaluation", self.header(entry)),
                edge: None,
                timestamp: Utc::now()
            });
        }
        fired
    }

    /// Collects the edge entries matching an accepted edge. `level` is
    /// the line level right after the edge.
    pub fn evaluate_edge(&self, detected: EdgeDirection, level: Level) -> Vec<ConditionalTrigger>
    {
        let state_str = match detected
        {
            EdgeDirection::Rising => "Rising",
            _ => "Falling"
        };

        self.entries
            .iter()
            .filter_map(|entry| {
                let (signal_select, edge_direction) = match entry.mode
                {
                    EntryMode::Edge { signal_select, edge_direction } => (signal_select, edge_direction),
                    EntryMode::Periodic { .. } => return None
                };
                if !edge_direction.matches(detected)
                {
                    return None;
                }
                let message = match signal_select
                {
                    SignalSelect::Edge => format!("{} {} edge detected", self.header(entry), state_str),
                    SignalSelect::State { high } =>
                    {
                        if level.is_high() != high
                        {
                            return None;
                        }
                        format!("{} GPIO state detected (state = {})", self.header(entry), high as u8)
                    }
                };
                Some(ConditionalTrigger {
                    conditional_id: entry.unique_id.clone(),
                    action: entry.action.clone(),
                    input_id: self.input_id.clone(),
                    message,
                    edge: Some(detected),
                    timestamp: Utc::now()
                })
            })
            .collect()
    }
}
