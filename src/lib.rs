pub mod data;
pub mod error;
pub mod generator;
pub mod graph;
pub mod loss;
pub mod model;
pub mod module;
pub mod training;
pub mod vgg;
