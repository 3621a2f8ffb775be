pub mod client;
pub mod operations;

pub use client::{AdafruitClient, DryRunClient, UploadClient, UploadError};
pub use operations::{upload_reading, FeedKeys, Uploader};
