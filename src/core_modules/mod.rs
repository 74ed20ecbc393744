pub mod aligner;
pub mod blob_detector;
pub mod colony;
pub mod colony_filter;
pub mod frame;
pub mod growth;
pub mod pixel;
pub mod plate_locator;
pub mod tracker;
pub mod utils;
