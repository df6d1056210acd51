//! writ: an authorization policy engine embedded in your application
//!
//! # Overview
//!
//! writ provides a declarative policy language for expressing authorization logic.
//! You define this logic separately from the rest of your application code,
//! but it executes inside the application and can call directly into it.
//!
//! # Example
//!
//! To get started, create a new `Writ` instance, and load policies from either a
//! string or a file:
//!
//! ```
//! # use writ::Writ;
//! # fn main() -> anyhow::Result<()> {
//! let mut writ = Writ::new();
//! writ.load_str(r#"allow(actor, action, resource) if actor = "alice";"#)?;
//! assert!(writ.is_allowed("alice", "read", "doc")?);
//! # Ok(())
//! # }
//! ```
//!
//! You can register classes with writ, which makes it possible to use them for type checking,
//! as well as accessing attributes in policies.
//! ```
//! # fn main() -> anyhow::Result<()> {
//! use writ::{Writ, WritClass};
//!
//! let mut writ = Writ::new();
//!
//! #[derive(Clone)]
//! struct User {
//!     pub username: String,
//! }
//!
//! impl WritClass for User {}
//!
//! impl User {
//!     fn superusers() -> Vec<String> {
//!         vec!["alice".to_string(), "charlie".to_string()]
//!     }
//! }
//!
//! writ.register_class(
//!    User::get_writ_class_builder()
//!         .add_attribute_getter("username", |u: &User| u.username.clone())
//!         .add_class_method("superusers", User::superusers)
//!         .build()
//! )?;
//!
//! writ.load_str(r#"allow(actor: User, action, resource) if
//!                     actor.username.ends_with("example.com");"#)?;
//!
//! let user = User {
//!     username: "alice@example.com".to_owned(),
//! };
//! assert!(writ.is_allowed(user, "foo", "bar")?);
//! Ok(())
//! # }
//! ```

#[macro_use]
pub mod macros;

pub(crate) mod builtins;
pub mod errors;
mod host;
mod query;
mod writ;

pub use crate::writ::{Action, Writ};
pub use errors::{AuthorizationError, WritError, Result};
pub use host::{
    Class, ClassBuilder, FromWrit, FromWritList, Instance, ToWrit, ToWritList, ToWritResults,
    WritValue, WritValueType,
};
pub use query::{Query, ResultSet};
pub use writ_core::filter::{Comparison, Condition, Datum, Filter, Projection, Relation};
pub use writ_core::kb::{FieldType, RelationKind};
pub use writ_core::QueryOptions;

/// Classes that can be used as types in policies.
///
/// Implementing this trait and `Clone` automatically makes the
/// type `FromWrit` and `ToWrit`, so it can be used with
/// `Writ::is_allowed` calls.
///
/// The default implementation creates a class definition with
/// no attributes or methods registered. Use `get_writ_class_builder`
/// to register attributes and methods.
///
/// **Note** that the returned `Class` still must be registered on a `Writ`
/// instance using `Writ::register_class`.
pub trait WritClass: Sized + 'static {
    /// Returns the `Class` ready for registration
    fn get_writ_class() -> Class {
        Self::get_writ_class_builder().build()
    }

    /// Returns the partially defined `Class` for this type.
    ///
    /// Can still have methods added to it with `add_method`, and attributes
    /// with `add_attribute_getter`.
    /// Use `Class::build` to finish defining the type.
    fn get_writ_class_builder() -> ClassBuilder<Self> {
        Class::builder()
    }
}
