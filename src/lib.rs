pub mod about;
pub mod batch;
pub mod centroid;
pub mod config;
pub mod dataset;
pub mod engine;
pub mod error;
pub mod interaction;
pub mod metrics;
pub mod proximity;
pub mod segmentation;
pub mod session;
pub mod track_store;
pub mod tracks;
pub mod volume;
