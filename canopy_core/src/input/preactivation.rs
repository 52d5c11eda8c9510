use crate::cfg::PreOutputConfig;
use crate::io::OutputControl;
use crate::lock::ResourceKey;
use crate::trace::trace_helper::TraceHelper;
use std::sync::Arc;
use std::time::Instant;

/// # PreActivationSequencer
/// Switches an auxiliary output (e.g. a sensor supply relay) on ahead of
/// a read. The returned deadline is a gate for the scheduler, nothing
/// here blocks.
pub struct PreActivationSequencer
{
    cfg: Option<PreOutputConfig>,
    outputs: Arc<dyn OutputControl>,
    tracer: TraceHelper
}

impl PreActivationSequencer
{
    pub fn new(cfg: Option<PreOutputConfig>, outputs: Arc<dyn OutputControl>, tracer: TraceHelper) -> Self
    {
        PreActivationSequencer { cfg, outputs, tracer }
    }

    pub fn is_configured(&self) -> bool
    {
        self.cfg.is_some()
    }

    /// Lock shared by every input using the same pre-activation output.
    pub fn lock_key(&self) -> Option<ResourceKey>
    {
        self.cfg.as_ref().map(|c| ResourceKey::PreOutput { output_id: c.output_id.clone(), channel: c.channel })
    }

    /// Switches the output on and returns when the read may start, or
    /// None if no pre-activation is configured.
    pub fn maybe_preactivate(&self, now: Instant) -> Option<Instant>
    {
        let cfg = self.cfg.as_ref()?;
        let duration = cfg.duration();
        if cfg.during_measure
        {
            // stays on until after_measure
            self.outputs.output_on(&cfg.output_id, cfg.channel, None);
        }
        else
        {
            self.outputs.output_on(&cfg.output_id, cfg.channel, Some(duration));
        }
        self.tracer.debug(format!("Pre-output {} on, read in {} ms", cfg.output_id, duration.as_millis()));
        Some(now + duration)
    }

    /// Called once the read is done.
    pub fn after_measure(&self)
    {
        if let Some(cfg) = self.cfg.as_ref().filter(|c| c.during_measure)
        {
            self.outputs.output_off(&cfg.output_id, cfg.channel);
        }
    }

    /// Called before the controller stops.
    pub fn pre_stop(&self)
    {
        if let Some(cfg) = self.cfg.as_ref()
        {
            self.outputs.output_off(&cfg.output_id, cfg.channel);
        }
    }
}
