pub mod alerts;
pub mod apply;
pub mod context;
pub mod controller;
pub mod dispatch;
pub mod drift;
pub mod fleet;
pub mod handoff;
pub mod health;
pub mod packets;
pub mod policy;
pub mod projector;
pub mod promotion;
pub mod receipts;
pub mod reconcile;
pub mod redelivery;
pub mod registry;
pub mod store;
pub mod thresholds;
pub mod transport;
