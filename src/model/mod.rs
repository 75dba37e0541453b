mod head;
mod transfer;
mod vgg;
mod weights;

pub use head::*;
pub use transfer::*;
pub use vgg::*;
pub use weights::*;
