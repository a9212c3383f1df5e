mod connection;
mod manager;

pub use connection::{initiate_connection, MqttLink};
