use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::bindings::Bindings;
use super::terms::*;
use super::traces::*;

/// What a query needs from the host next.
///
/// Every event that carries a `call_id` must be answered with that id
/// before the query can continue.
#[allow(clippy::large_enum_variant)]
#[must_use]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum QueryEvent {
    None,

    /// The query has no more results.
    Done {
        result: bool,
    },

    /// `debug()` was hit or the debugger stopped; answer with a debug command.
    Debug {
        message: String,
    },

    /// Construct an instance from `constructor` (a call term naming the
    /// class) and remember it under `instance_id`.
    MakeExternal {
        instance_id: u64,
        constructor: Term,
    },

    /// Read a field or call a method. Answer with zero or more call
    /// results and then `None`.
    ExternalCall {
        call_id: u64,
        instance: Term,
        /// Field or method name.
        attribute: Symbol,
        /// Positional arguments; `None` for a field read.
        args: Option<Vec<Term>>,
        kwargs: Option<BTreeMap<Symbol, Term>>,
    },

    /// Is `instance` an instance of `class_tag` (or a subclass)?
    ExternalIsa {
        call_id: u64,
        instance: Term,
        class_tag: Symbol,
    },

    /// Is `left_class_tag` the same class as, or a subclass of, `right_class_tag`?
    ExternalIsSubclass {
        call_id: u64,
        left_class_tag: Symbol,
        right_class_tag: Symbol,
    },

    /// Does following `path` from an instance of `base_tag` lead to an
    /// instance of `class_tag`?
    ExternalIsaWithPath {
        call_id: u64,
        base_tag: Symbol,
        path: TermList,
        class_tag: Symbol,
    },

    /// Compare two operands at least one of which is a host instance.
    ExternalOp {
        call_id: u64,
        operator: Operator,
        args: TermList,
    },

    /// Produce the next element of a host iterable, or `None` when exhausted.
    NextExternal {
        call_id: u64,
        iterable: Term,
    },

    Result {
        bindings: Bindings,
        trace: Option<TraceResult>,
    },
}

impl QueryEvent {
    /// The call id the host has to answer, if any.
    pub fn call_id(&self) -> Option<u64> {
        match self {
            Self::ExternalCall { call_id, .. }
            | Self::ExternalIsa { call_id, .. }
            | Self::ExternalIsSubclass { call_id, .. }
            | Self::ExternalIsaWithPath { call_id, .. }
            | Self::ExternalOp { call_id, .. }
            | Self::NextExternal { call_id, .. } => Some(*call_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_serialize_externally_tagged() {
        let event = QueryEvent::ExternalCall {
            call_id: 3,
            instance: term!("x"),
            attribute: sym!("name"),
            args: None,
            kwargs: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["ExternalCall"]["call_id"], 3);
        assert_eq!(json["ExternalCall"]["attribute"], "name");
        assert_eq!(event.call_id(), Some(3));

        let done: QueryEvent = serde_json::from_str(r#"{"Done": {"result": true}}"#).unwrap();
        assert!(matches!(done, QueryEvent::Done { result: true }));
        assert_eq!(done.call_id(), None);
    }

    #[test]
    fn test_result_round_trips() {
        let event = QueryEvent::Result {
            bindings: hashmap! {sym!("x") => term!([1, "two"])},
            trace: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        match serde_json::from_str::<QueryEvent>(&json).unwrap() {
            QueryEvent::Result { bindings, trace } => {
                assert_eq!(bindings[&sym!("x")], term!([1, "two"]));
                assert!(trace.is_none());
            }
            e => panic!("unexpected event {:?}", e),
        }
    }
}
