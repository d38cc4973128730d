//! Fulfillment pipeline: customer photo to print-ready STL, handed to a print
//! partner exactly once.
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod fetch;
pub mod http;
pub mod lifecycle;
pub mod mesh;
pub mod model;
pub mod outbox;
pub mod pipeline;
pub mod quality;
pub mod reconstruction;
pub mod segmentation;
pub mod sweeper;
