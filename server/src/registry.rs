use serde::Serialize;
use sha1::{Digest, Sha1};
use std::any::TypeId;
use tracing::debug;

use crate::error::{FormBuilderError, FormBuilderResult};
use crate::execution::ActionContext;
use crate::fields::Choice;

pub const NO_ACTIONS_LABEL: &str = "No actions registered";

/// Capability every post-submission action provides.
pub trait FormAction: Send + Sync {
    fn execute(&self, ctx: &mut ActionContext<'_>) -> FormBuilderResult<()>;
}

/// Static description of an action type. Registration goes through this
/// trait so the registry can build fresh instances per submission.
pub trait ActionDescriptor: FormAction + Default + 'static {
    /// Label shown in the action selection control. Must not be empty.
    fn verbose_name() -> &'static str;

    /// Implementation identity the action identifier is hashed from.
    fn identity() -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Parameter fields this action reads from the form's parameter bag.
    fn parameter_fields() -> &'static [ParameterField] {
        &[]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterKind {
    Text,
    Textarea,
    Url,
    Select,
}

/// One namespaced entry of an action's parameter form, e.g. `sendemail_recipients`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ParameterField {
    pub name: &'static str,
    pub label: &'static str,
    pub kind: ParameterKind,
    pub required: bool,
}

/// Stable identifier of an action: hex SHA-1 of its implementation identity.
pub fn action_id(identity: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(identity.as_bytes());
    hex::encode(hasher.finalize())
}

pub struct RegisteredAction {
    pub id: String,
    pub label: &'static str,
    pub identity: &'static str,
    pub parameters: &'static [ParameterField],
    type_id: TypeId,
    factory: fn() -> Box<dyn FormAction>,
}

impl RegisteredAction {
    /// Fresh action instance for one submission.
    pub fn instantiate(&self) -> Box<dyn FormAction> {
        (self.factory)()
    }
}

impl std::fmt::Debug for RegisteredAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredAction")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("identity", &self.identity)
            .finish()
    }
}

fn build<A: ActionDescriptor>() -> Box<dyn FormAction> {
    Box::new(A::default())
}

/// Catalog of available actions, kept in registration order.
///
/// Built once at start-up and shared read-only (usually behind an `Arc`);
/// mutation needs `&mut` so racing writers are ruled out by the borrow checker.
#[derive(Debug, Default)]
pub struct ActionRegistry {
    entries: Vec<RegisteredAction>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action type and return its identifier.
    ///
    /// Re-registering the same type is a no-op. A different type hashing to an
    /// identifier already in use is a configuration error.
    pub fn register<A: ActionDescriptor>(&mut self) -> FormBuilderResult<String> {
        let label = A::verbose_name();
        if label.trim().is_empty() {
            return Err(FormBuilderError::configuration(format!(
                "action {} needs a non-empty verbose name",
                A::identity()
            )));
        }
        let id = action_id(A::identity());
        let type_id = TypeId::of::<A>();

        if let Some(existing) = self.entries.iter().find(|e| e.id == id) {
            if existing.type_id == type_id {
                return Ok(id);
            }
            return Err(FormBuilderError::configuration(format!(
                "action identifier {} of {} is already taken by {}",
                id,
                A::identity(),
                existing.identity
            )));
        }

        debug!(action = label, id = %id, "registered action");
        self.entries.push(RegisteredAction {
            id: id.clone(),
            label,
            identity: A::identity(),
            parameters: A::parameter_fields(),
            type_id,
            factory: build::<A>,
        });
        Ok(id)
    }

    /// Remove an action type. Does nothing if it was never registered.
    pub fn unregister<A: ActionDescriptor>(&mut self) {
        let type_id = TypeId::of::<A>();
        self.entries.retain(|e| e.type_id != type_id);
    }

    pub fn get_action_class(&self, id: &str) -> Option<&RegisteredAction> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// `(identifier, label)` choices for the action selection control. An
    /// empty registry yields a single empty placeholder group.
    pub fn get_registered_actions(&self) -> Vec<Choice> {
        if self.entries.is_empty() {
            return vec![Choice::Group(NO_ACTIONS_LABEL.to_string(), Vec::new())];
        }
        self.entries
            .iter()
            .map(|e| Choice::item(e.id.clone(), e.label))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredAction> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Noop;

    impl FormAction for Noop {
        fn execute(&self, _ctx: &mut ActionContext<'_>) -> FormBuilderResult<()> {
            Ok(())
        }
    }

    impl ActionDescriptor for Noop {
        fn verbose_name() -> &'static str {
            "Do nothing"
        }
    }

    #[derive(Default)]
    struct Impostor;

    impl FormAction for Impostor {
        fn execute(&self, _ctx: &mut ActionContext<'_>) -> FormBuilderResult<()> {
            Ok(())
        }
    }

    impl ActionDescriptor for Impostor {
        fn verbose_name() -> &'static str {
            "Impostor"
        }

        fn identity() -> &'static str {
            std::any::type_name::<Noop>()
        }
    }

    #[derive(Default)]
    struct Unlabelled;

    impl FormAction for Unlabelled {
        fn execute(&self, _ctx: &mut ActionContext<'_>) -> FormBuilderResult<()> {
            Ok(())
        }
    }

    impl ActionDescriptor for Unlabelled {
        fn verbose_name() -> &'static str {
            "  "
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = ActionRegistry::new();
        let id = registry.register::<Noop>().unwrap();
        assert_eq!(id, action_id(std::any::type_name::<Noop>()));
        assert_eq!(id.len(), 40);

        let entry = registry.get_action_class(&id).unwrap();
        assert_eq!(entry.label, "Do nothing");

        registry.unregister::<Noop>();
        assert!(registry.get_action_class(&id).is_none());
    }

    #[test]
    fn test_register_same_type_twice_is_idempotent() {
        let mut registry = ActionRegistry::new();
        let first = registry.register::<Noop>().unwrap();
        let second = registry.register::<Noop>().unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_identifier_collision_is_a_configuration_error() {
        let mut registry = ActionRegistry::new();
        registry.register::<Noop>().unwrap();
        let err = registry.register::<Impostor>().unwrap_err();
        assert!(matches!(err, FormBuilderError::Configuration(_)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_empty_label_is_rejected() {
        let mut registry = ActionRegistry::new();
        assert!(matches!(
            registry.register::<Unlabelled>(),
            Err(FormBuilderError::Configuration(_))
        ));
    }

    #[test]
    fn test_unregister_absent_is_safe() {
        let mut registry = ActionRegistry::new();
        registry.unregister::<Noop>();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_registered_actions_placeholder_when_empty() {
        let registry = ActionRegistry::new();
        let actions = registry.get_registered_actions();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0], Choice::Group(NO_ACTIONS_LABEL.to_string(), vec![]));
    }

    #[test]
    fn test_registered_actions_keep_registration_order() {
        let mut registry = ActionRegistry::new();
        let noop = registry.register::<Noop>().unwrap();
        registry.unregister::<Noop>();
        registry.register::<Unlabelled>().ok();
        registry.register::<Noop>().unwrap();
        assert_eq!(registry.get_registered_actions(), vec![Choice::item(noop, "Do nothing")]);
    }

    #[test]
    fn test_instantiate_builds_fresh_action() {
        let mut registry = ActionRegistry::new();
        let id = registry.register::<Noop>().unwrap();
        let action = registry.get_action_class(&id).unwrap().instantiate();
        let harness = crate::execution::tests::Harness::new();
        let mut ctx = harness.context();
        action.execute(&mut ctx).unwrap();
        assert!(ctx.result.field_errors.is_empty());
    }
}
