use std::fmt::Display;

/// # TraceHelper
/// Per component logging handle. Every event carries a `module` field
/// naming the emitting component, e.g. "Input/dht-greenhouse".
#[derive(Clone, Debug)]
pub struct TraceHelper
{
    source_mod: String
}

impl TraceHelper
{
    pub fn new(module_name: String) -> Self
    {
        TraceHelper
        {
            source_mod: module_name
        }
    }

    /// A helper for a sub component, "Parent/child".
    pub fn child(&self, name: &str) -> Self
    {
        TraceHelper::new(format!("{}/{}", self.source_mod, name))
    }

    pub fn module(&self) -> &str
    {
        &self.source_mod
    }

    pub fn trace(&self, message: String)
    {
        tracing::trace!(module = %self.source_mod, "{}", message);
    }

    pub fn trace_str(&self, message: &str)
    {
        tracing::trace!(module = %self.source_mod, "{}", message);
    }

    pub fn debug(&self, message: impl Display)
    {
        tracing::debug!(module = %self.source_mod, "{}", message);
    }

    pub fn info(&self, message: impl Display)
    {
        tracing::info!(module = %self.source_mod, "{}", message);
    }

    pub fn warn(&self, message: impl Display)
    {
        tracing::warn!(module = %self.source_mod, "{}", message);
    }

    pub fn error(&self, message: impl Display)
    {
        tracing::error!(module = %self.source_mod, "{}", message);
    }

    /// Logs an error in a given category, e.g. "store-connection", so
    /// operators can filter on it.
    pub fn error_in(&self, category: &str, message: impl Display)
    {
        tracing::error!(module = %self.source_mod, category = category, "{}", message);
    }

    /// Logs an error together with its chain of causes.
    pub fn error_chain(&self, context: &str, err: &dyn std::error::Error)
    {
        let mut text = format!("{}: {}", context, err);
        let mut source = err.source();
        while let Some(cause) = source
        {
            text.push_str(&format!(" (caused by: {})", cause));
            source = cause.source();
        }
        tracing::error!(module = %self.source_mod, "{}", text);
    }
}
