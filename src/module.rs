pub mod conv2d_norm;
pub mod residual;
pub mod upsample;
