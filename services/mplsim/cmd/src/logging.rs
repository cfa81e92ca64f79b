use std::fmt;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

/// ANSI color codes for console output
const COLOR_RESET: &str = "\x1b[0m";
const COLOR_CYAN: &str = "\x1b[36m";
const COLOR_GREEN: &str = "\x1b[32m";
const COLOR_BRIGHT_YELLOW: &str = "\x1b[93m";
const COLOR_BRIGHT_RED: &str = "\x1b[91m";
const COLOR_BRIGHT_GRAY: &str = "\x1b[90m";

const COMPONENT_WIDTH: usize = 18;
const LOG_LEVEL_WIDTH: usize = 7;

/// `[timestamp] [component] [level] message`
pub struct SimLogFormatter {
    default_component: String,
    color_enabled: bool,
}

/// Log at info level on behalf of a component
#[macro_export]
macro_rules! component_info {
    ($component:expr, $($arg:tt)*) => {
        tracing::info!(component = $component, $($arg)*)
    };
}

/// Log at warn level on behalf of a component
#[macro_export]
macro_rules! component_warn {
    ($component:expr, $($arg:tt)*) => {
        tracing::warn!(component = $component, $($arg)*)
    };
}

impl SimLogFormatter {
    pub fn new(default_component: &str) -> Self {
        Self {
            default_component: default_component.to_string(),
            color_enabled: is_terminal(),
        }
    }

    fn format_component(&self, component: Option<&str>) -> String {
        let name = match component {
            Some(comp) => format!("mplsim-{}", comp),
            None => self.default_component.clone(),
        };

        if name.chars().count() > COMPONENT_WIDTH {
            let truncated: String = name.chars().take(COMPONENT_WIDTH - 1).collect();
            format!("{}…", truncated)
        } else {
            format!("{:<width$}", name, width = COMPONENT_WIDTH)
        }
    }

    /// Level column and its color
    fn level_style(&self, level: &Level) -> (String, &'static str) {
        let (label, color) = match *level {
            Level::ERROR => ("✗ ERROR", COLOR_BRIGHT_RED),
            Level::WARN => ("⚠ WARN", COLOR_BRIGHT_YELLOW),
            Level::INFO => ("ℹ INFO", COLOR_GREEN),
            Level::DEBUG => ("◦ DEBUG", COLOR_BRIGHT_GRAY),
            Level::TRACE => ("◦ TRACE", COLOR_BRIGHT_GRAY),
        };
        // icons count as one char but are wider on most terminals
        let label = format!("{:<width$}", label, width = LOG_LEVEL_WIDTH + 2);
        (label, if self.color_enabled { color } else { "" })
    }
}

impl<S, N> FormatEvent<S, N> for SimLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(&self, _ctx: &FmtContext<'_, S, N>, mut writer: Writer<'_>, event: &Event<'_>) -> fmt::Result {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let mut fields = FieldVisitor::default();
        event.record(&mut fields);

        let component = self.format_component(fields.component.as_deref());
        let (level, color) = self.level_style(event.metadata().level());
        let (reset, dim) = match self.color_enabled {
            true => (COLOR_RESET, COLOR_CYAN),
            false => ("", ""),
        };

        writeln!(
            writer,
            "{dim}[{timestamp}] [{component}] [{color}{level}{reset}] {}{reset}",
            fields.message
        )
    }
}

/// Pulls the message and component fields out of an event
#[derive(Default)]
struct FieldVisitor {
    message: String,
    component: Option<String>,
}

fn unquote(value: String) -> String {
    match value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) {
        Some(inner) => inner.to_string(),
        None => value,
    }
}

impl FieldVisitor {
    fn set(&mut self, field: &Field, value: String) {
        match field.name() {
            "message" => self.message = value,
            "component" => self.component = Some(value),
            _ => {}
        }
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.set(field, unquote(format!("{:?}", value)));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.set(field, value.to_string());
    }
}

fn is_terminal() -> bool {
    std::env::var("TERM").map_or(false, |term| term != "dumb")
}
