mod connection;
mod helpers;
mod migrations;
pub mod models;

mod repositories {
    mod events;
    mod users;
}

pub use connection::Database;
