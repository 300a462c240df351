//! Lifecycle hooks and the method table built from an app registration.

use std::collections::HashMap;
use std::fmt;

use rhai::{FnPtr, Map};

/// Lifecycle callbacks an app may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifecycle {
    /// Fired once, right after registration.
    Launch,
    /// The app became visible.
    Show,
    /// The app was hidden.
    Hide,
    /// Fired after a call that committed data mutations.
    Update,
}

impl Lifecycle {
    /// Every lifecycle hook.
    pub const ALL: [Self; 4] = [Self::Launch, Self::Show, Self::Hide, Self::Update];

    /// Property name the callback is registered under.
    #[must_use]
    pub fn callback_name(self) -> &'static str {
        match self {
            Self::Launch => "onLaunch",
            Self::Show => "onShow",
            Self::Hide => "onHide",
            Self::Update => "onUpdate",
        }
    }

    /// Look a hook up by its callback name.
    #[must_use]
    pub fn from_callback_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|hook| hook.callback_name() == name)
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.callback_name())
    }
}

/// Function-pointer properties of the registered app, by name.
#[derive(Default)]
pub(crate) struct MethodTable {
    entries: HashMap<String, FnPtr>,
}

impl MethodTable {
    pub(crate) fn from_registration(app: &Map) -> Self {
        let entries = app
            .iter()
            .filter_map(|(name, value)| {
                value
                    .clone()
                    .try_cast::<FnPtr>()
                    .map(|callback| (name.to_string(), callback))
            })
            .collect();
        Self { entries }
    }

    /// A callable method. Lifecycle callbacks are not methods.
    pub(crate) fn method(&self, name: &str) -> Option<&FnPtr> {
        if Lifecycle::from_callback_name(name).is_some() {
            return None;
        }
        self.entries.get(name)
    }

    pub(crate) fn lifecycle(&self, hook: Lifecycle) -> Option<&FnPtr> {
        self.entries.get(hook.callback_name())
    }

    /// Method names, sorted.
    pub(crate) fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .keys()
            .filter(|name| Lifecycle::from_callback_name(name).is_none())
            .cloned()
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use rhai::Dynamic;

    use super::*;

    fn registration() -> Map {
        let mut app = Map::new();
        app.insert("data".into(), Dynamic::from_map(Map::new()));
        app.insert(
            "increment".into(),
            Dynamic::from(FnPtr::new("increment").unwrap()),
        );
        app.insert(
            "onLaunch".into(),
            Dynamic::from(FnPtr::new("launch").unwrap()),
        );
        app.insert("label".into(), Dynamic::from("not a function"));
        app
    }

    #[test]
    fn test_lifecycle_names_round_trip() {
        for hook in Lifecycle::ALL {
            assert_eq!(Lifecycle::from_callback_name(hook.callback_name()), Some(hook));
        }
        assert_eq!(Lifecycle::from_callback_name("onDestroy"), None);
    }

    #[test]
    fn test_only_function_pointers_are_collected() {
        let table = MethodTable::from_registration(&registration());
        assert!(table.method("increment").is_some());
        assert!(table.method("label").is_none());
        assert!(table.method("data").is_none());
        assert_eq!(table.method_names(), vec!["increment".to_string()]);
    }

    #[test]
    fn test_lifecycle_callbacks_are_not_methods() {
        let table = MethodTable::from_registration(&registration());
        assert!(table.method("onLaunch").is_none());
        assert_eq!(
            table.lifecycle(Lifecycle::Launch).map(FnPtr::fn_name),
            Some("launch")
        );
        assert!(table.lifecycle(Lifecycle::Update).is_none());
    }
}
