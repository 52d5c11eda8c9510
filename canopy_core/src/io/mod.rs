use crate::core::broadcast_channel::{GenericReceiver, GenericSender};
use crate::core::channel_manager::ChannelManager;
use crate::core::timer::{Timer, TimerGuard};
use crate::core::SystemMessage;
use crate::trace::trace_helper::TraceHelper;
use canopy_hal::output::OutputDriver;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq)]
pub enum OutputCommand
{
    /// Switch on; with a duration the output switches itself off again.
    On { output_id: String, channel: u32, duration: Option<Duration> },
    Off { output_id: String, channel: u32 }
}

/// Fire-and-forget output control as seen by the acquisition engine.
/// Callers never learn whether or when the command was carried out.
#[cfg_attr(test, mockall::automock)]
pub trait OutputControl: Send + Sync
{
    fn output_on(&self, output_id: &str, channel: u32, duration: Option<Duration>);
    fn output_off(&self, output_id: &str, channel: u32);
}

/// # OutputBus
/// `OutputControl` that publishes `OutputCommand`s on the channel
/// manager. Whoever runs the `OutputManager` carries them out.
#[derive(Clone)]
pub struct OutputBus
{
    commands: GenericSender<OutputCommand>
}

impl OutputBus
{
    pub fn new(chm: &ChannelManager) -> Self
    {
        OutputBus { commands: chm.get_sender() }
    }
}

impl OutputControl for OutputBus
{
    fn output_on(&self, output_id: &str, channel: u32, duration: Option<Duration>)
    {
        self.commands.send(OutputCommand::On { output_id: output_id.to_string(), channel, duration });
    }

    fn output_off(&self, output_id: &str, channel: u32)
    {
        self.commands.send(OutputCommand::Off { output_id: output_id.to_string(), channel });
    }
}

/// Spawns the output manager thread. It runs until a
/// `SystemMessage::Shutdown` is seen.
pub fn launch(chm: &ChannelManager, driver: Box<dyn OutputDriver>) -> std::io::Result<thread::JoinHandle<()>>
{
    let mut outman = OutputManager::new(TraceHelper::new("IO/OutputManager".to_string()), chm, driver);
    let system_events = chm.get_receiver::<SystemMessage>();
    thread::Builder::new().name("outputs".to_string()).spawn(move || {
        loop
        {
            if let Some(SystemMessage::Shutdown) = system_events.try_receive()
            {
                break;
            }
            outman.run_once(Duration::from_millis(100));
        }
        outman.stop();
    })
}

/// # The output manager
/// Carries out `OutputCommand`s on the hardware output driver. A timed
/// "on" schedules the matching "off" on the timer; any later command for
/// the same output cancels a pending switch-back.
pub struct OutputManager
{
    commands: GenericReceiver<OutputCommand>,
    tracer: TraceHelper,
    timer: Arc<Timer>,
    driver: Box<dyn OutputDriver>,
    switchbacks: HashMap<(String, u32), TimerGuard>
}

impl OutputManager
{
    pub fn new(trace: TraceHelper, chm: &ChannelManager, driver: Box<dyn OutputDriver>) -> Self
    {
        OutputManager {
            commands:    chm.get_receiver(),
            tracer:      trace,
            timer:       Timer::new(),
            driver,
            switchbacks: HashMap::new()
        }
    }

    /// Handles at most one command. Returns false if none arrived
    /// within `timeout`.
    pub fn run_once(&mut self, timeout: Duration) -> bool
    {
        match self.commands.receive_with_timeout(timeout)
        {
            Some(cmd) => { self.dispatch_output_command(cmd); true }
            None => false
        }
    }

    pub fn stop(&mut self)
    {
        self.switchbacks.clear();
        self.timer.stop();
    }

    fn dispatch_output_command(&mut self, command: OutputCommand)
    {
        let (output_id, channel, on, duration) = match &command
        {
            OutputCommand::On { output_id, channel, duration } => (output_id.clone(), *channel, true, *duration),
            OutputCommand::Off { output_id, channel } => (output_id.clone(), *channel, false, None)
        };

        // Dropping the guard keeps an older switch-back from firing.
        self.switchbacks.remove(&(output_id.clone(), channel));

        self.tracer.debug(format!("Switching output {} channel {} {}", output_id, channel, if on { "on" } else { "off" }));
        if let Err(e) = self.driver.set(&output_id, channel, on)
        {
            self.tracer.error(format!("Cannot switch output {} channel {}: {}", output_id, channel, e));
            return;
        }

        if let Some(switch_time) = duration.filter(|d| *d > Duration::from_secs(0))
        {
            self.tracer.trace(format!("Schedule switchback in {} ms", switch_time.as_millis()));
            let sender = self.commands.create_sender();
            let off = OutputCommand::Off { output_id: output_id.clone(), channel };
            let guard = self.timer.schedule(Box::new(move || sender.send(off)), switch_time);
            self.switchbacks.insert((output_id, channel), guard);
        }
    }
}
