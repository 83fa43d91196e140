//! Database entities

pub mod tunnel;

pub use tunnel::Entity as Tunnel;

pub mod prelude {
    pub use super::tunnel::Entity as Tunnel;
}
