//! Client context: the active conversation and task.

use crate::lifecycle::ids::{ConversationId, TaskId};

/// Ids the client is currently working with.
///
/// Setting a conversation clears the task; [`reset`](Self::reset) starts over.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientContext {
    conversation_id: Option<ConversationId>,
    task_id: Option<TaskId>,
}

impl ClientContext {
    /// Empty context.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            conversation_id: None,
            task_id: None,
        }
    }

    /// Active conversation.
    #[must_use]
    pub const fn active_conversation(&self) -> Option<&ConversationId> {
        self.conversation_id.as_ref()
    }

    /// Active task.
    #[must_use]
    pub const fn active_task(&self) -> Option<&TaskId> {
        self.task_id.as_ref()
    }

    /// Switch conversation. The active task is cleared.
    pub fn set_active_conversation(&mut self, id: Option<ConversationId>) {
        self.conversation_id = id;
        self.task_id = None;
    }

    /// Switch task within the active conversation.
    pub fn set_active_task(&mut self, id: Option<TaskId>) {
        self.task_id = id;
    }

    /// Start a new conversation.
    pub fn reset(&mut self) {
        self.conversation_id = None;
        self.task_id = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_switch_conversation_clears_task() {
        let mut context = ClientContext::new();
        context.set_active_conversation(Some("c-1".into()));
        context.set_active_task(Some("t-1".into()));
        context.set_active_conversation(Some("c-2".into()));
        assert_eq!(context.active_conversation().map(ConversationId::as_str), Some("c-2"));
        assert!(context.active_task().is_none());

        context.set_active_task(Some("t-2".into()));
        context.reset();
        assert_eq!(context, ClientContext::default());
    }
}
