use crate::cfg::{EdgeDirection, EdgeInputConfig};
use canopy_hal::gpio::{Edge, Level};
use std::time::{Duration, Instant};

/// # EdgeMonitor
/// Debounces the edges of a digital input. After an accepted edge every
/// further edge is ignored until `reset_period` has passed.
#[derive(Debug)]
pub struct EdgeMonitor
{
    edge: EdgeDirection,
    reset_period: Duration,
    reset_timer: Option<Instant>
}

impl EdgeMonitor
{
    pub fn new(cfg: &EdgeInputConfig) -> Self
    {
        EdgeMonitor { edge: cfg.edge, reset_period: cfg.reset_period(), reset_timer: None }
    }

    /// Edge to subscribe to at the GPIO backend.
    pub fn hal_edge(&self) -> Edge
    {
        match self.edge
        {
            EdgeDirection::Rising => Edge::Rising,
            EdgeDirection::Falling => Edge::Falling,
            EdgeDirection::Both => Edge::Both
        }
    }

    /// Returns the direction of an accepted edge, None if it fell into
    /// the debounce window. `level` is the line level after the edge.
    pub fn on_edge(&mut self, now: Instant, level: Level) -> Option<EdgeDirection>
    {
        if let Some(reset) = self.reset_timer
        {
            if now < reset
            {
                return None;
            }
        }
        self.reset_timer = Some(now + self.reset_period);

        let rising = self.edge == EdgeDirection::Rising
                     || (self.edge == EdgeDirection::Both && level.is_high());
        Some(if rising { EdgeDirection::Rising } else { EdgeDirection::Falling })
    }
}
