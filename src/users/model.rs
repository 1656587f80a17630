use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Sqlite, query_builder::Separated};

use crate::item::rdbc::DatabaseItemBinder;

/// A user record, mapped by column position in the CSV file and by name in `app_user`.
///
/// Serialized field order is the export line layout: `id,name,email`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: String,
}

/// Binds a [`User`] to the `id, name, email` columns of `app_user`.
pub struct UserBinder;

impl DatabaseItemBinder<User, Sqlite> for UserBinder {
    fn bind(&self, item: &User, mut query_builder: Separated<Sqlite, &str>) {
        query_builder.push_bind(item.id);
        query_builder.push_bind(item.name.clone());
        query_builder.push_bind(item.email.clone());
    }
}
