use super::bindings::Bindings;
use super::error::PolicyResult;
use super::events::*;
use super::formatting::term_source;
use super::messages::*;
use super::terms::*;
use super::vm::*;

/// One running query. The host drives it by pulling events with
/// `next_event` and answering the ones that need a response.
pub struct Query {
    vm: VirtualMachine,
    term: Term,
    done: bool,
}

impl Query {
    pub fn new(vm: VirtualMachine, term: Term) -> Self {
        Self {
            vm,
            term,
            done: false,
        }
    }

    pub fn set_logging_options(&mut self, writ_log: Option<String>) {
        self.vm.set_logging_options(writ_log);
    }

    pub fn next_event(&mut self) -> PolicyResult<QueryEvent> {
        self.vm.run()
    }

    pub fn call_result(&mut self, call_id: u64, value: Option<Term>) -> PolicyResult<()> {
        self.vm.external_call_result(call_id, value)
    }

    pub fn question_result(&mut self, call_id: u64, result: bool) -> PolicyResult<()> {
        self.vm.external_question_result(call_id, result)
    }

    /// The host failed while answering `call_id`. The call yields no
    /// results; the query then fails the branch or, in strict mode, errors.
    pub fn application_error(&mut self, call_id: u64, msg: String) -> PolicyResult<()> {
        self.vm.external_error(msg);
        self.vm.external_call_result(call_id, None)
    }

    pub fn debug_command(&mut self, command: &str) -> PolicyResult<()> {
        self.vm.debug_command(command)
    }

    pub fn next_message(&self) -> Option<Message> {
        self.vm.messages.next()
    }

    pub fn source_info(&self) -> String {
        term_source(&self.term, true)
    }

    /// Variables bound so far, temporaries included but not constants.
    pub fn bindings(&self) -> Bindings {
        self.vm.bindings(true)
    }

    /// Bind a query variable before running, e.g. to mark it partial.
    pub fn bind(&mut self, name: Symbol, value: Term) -> PolicyResult<()> {
        self.vm.bind(&name, value)?;
        self.vm.query_contains_partial();
        Ok(())
    }
}

// Query as an iterator returns `None` after the first time `Done` is seen
impl Iterator for Query {
    type Item = PolicyResult<QueryEvent>;

    fn next(&mut self) -> Option<PolicyResult<QueryEvent>> {
        if self.done {
            return None;
        }
        let event = self.next_event();
        if let Ok(QueryEvent::Done { .. }) = event {
            self.done = true;
        }
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, RwLock};

    use super::*;
    use crate::kb::KnowledgeBase;

    fn query(kb: KnowledgeBase, term: Term) -> Query {
        let vm = VirtualMachine::new(
            Arc::new(RwLock::new(kb)),
            QueryOptions::default(),
            vec![Goal::Query { term: term.clone() }],
            MessageQueue::new(),
        );
        Query::new(vm, term)
    }

    #[test]
    fn test_iterator_stops_after_done() {
        let mut kb = KnowledgeBase::new();
        kb.add_rule(rule!("f", [1]));
        kb.add_rule(rule!("f", [2]));
        let events: Vec<_> = query(kb, term!(call!("f", [sym!("x")])))
            .collect::<PolicyResult<_>>()
            .unwrap();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], QueryEvent::Result { .. }));
        assert!(matches!(events[2], QueryEvent::Done { .. }));
    }

    #[test]
    fn test_bound_variable_shows_up_in_results() {
        let mut kb = KnowledgeBase::new();
        kb.add_rule(rule!("f", [1]));
        let mut q = query(kb, term!(call!("f", [sym!("x")])));
        q.bind(sym!("x"), term!(1)).unwrap();
        match q.next_event().unwrap() {
            QueryEvent::Result { bindings, .. } => assert_eq!(bindings[&sym!("x")], term!(1)),
            e => panic!("unexpected event: {:?}", e),
        }
    }
}
