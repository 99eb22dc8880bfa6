//! Open Responses stream event names.

macro_rules! event_names {
    ($(#[$doc:meta])* $group:ident { $($name:ident = $value:literal),+ $(,)? }) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy)]
        pub struct $group;

        impl $group {
            $(pub const $name: &'static str = $value;)+
        }
    };
}

event_names!(
    /// Lifecycle of the response resource
    ResponseEvent {
        CREATED = "response.created",
        QUEUED = "response.queued",
        IN_PROGRESS = "response.in_progress",
        COMPLETED = "response.completed",
        FAILED = "response.failed",
        INCOMPLETE = "response.incomplete",
    }
);

event_names!(OutputItemEvent {
    ADDED = "response.output_item.added",
    DONE = "response.output_item.done",
});

event_names!(ContentPartEvent {
    ADDED = "response.content_part.added",
    DONE = "response.content_part.done",
});

event_names!(OutputTextEvent {
    DELTA = "response.output_text.delta",
    DONE = "response.output_text.done",
});

event_names!(ReasoningTextEvent {
    DELTA = "response.reasoning_text.delta",
    DONE = "response.reasoning_text.done",
});

event_names!(FunctionCallEvent {
    ARGUMENTS_DELTA = "response.function_call_arguments.delta",
    ARGUMENTS_DONE = "response.function_call_arguments.done",
});

/// Error frame on SSE and WebSocket transports; not terminal by itself.
pub const ERROR_EVENT: &str = "error";

/// True for events after which a response stream accepts nothing more.
pub fn is_terminal_event(event_type: &str) -> bool {
    matches!(
        event_type,
        ResponseEvent::COMPLETED | ResponseEvent::FAILED | ResponseEvent::INCOMPLETE
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_events() {
        assert!(is_terminal_event(ResponseEvent::COMPLETED));
        assert!(is_terminal_event("response.failed"));
        assert!(is_terminal_event("response.incomplete"));
        assert!(!is_terminal_event(ResponseEvent::QUEUED));
        assert!(!is_terminal_event(OutputItemEvent::DONE));
        assert!(!is_terminal_event(ERROR_EVENT));
    }
}
