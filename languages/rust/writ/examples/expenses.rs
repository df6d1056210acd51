//! Authorizing access to expense reports.

use writ::{Writ, WritClass};
use tracing::{info, instrument};

#[derive(Clone, Debug)]
struct User {
    name: String,
    manages: Vec<String>,
}

impl WritClass for User {}

#[derive(Clone, Debug)]
struct Expense {
    submitted_by: String,
    amount: i64,
}

impl WritClass for Expense {}

const POLICY: &str = r#"
allow(user: User, "view", expense: Expense) if
    user.name = expense.submitted_by;

allow(user: User, "approve", expense: Expense) if
    expense.submitted_by in user.manages and
    expense.amount < 10000;
"#;

#[instrument]
fn setup() -> anyhow::Result<Writ> {
    let mut writ = Writ::new();
    writ.register_class(
        User::get_writ_class_builder()
            .add_attribute_getter("name", |u: &User| u.name.clone())
            .add_attribute_getter("manages", |u: &User| u.manages.clone())
            .build(),
    )?;
    writ.register_class(
        Expense::get_writ_class_builder()
            .add_attribute_getter("submitted_by", |e: &Expense| e.submitted_by.clone())
            .add_attribute_getter("amount", |e: &Expense| e.amount)
            .build(),
    )?;
    writ.load_str(POLICY)?;
    Ok(writ)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let writ = setup()?;

    let alice = User {
        name: "alice".to_owned(),
        manages: vec!["bhavik".to_owned()],
    };
    let expense = Expense {
        submitted_by: "bhavik".to_owned(),
        amount: 500,
    };

    for action in &["view", "approve"] {
        let allowed = writ.is_allowed(alice.clone(), action.to_string(), expense.clone())?;
        info!(action, allowed, "alice on bhavik's expense");
    }

    let actions: std::collections::HashSet<String> =
        writ.authorized_actions(alice, expense)?;
    info!(?actions, "authorized actions");
    Ok(())
}
