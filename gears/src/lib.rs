mod frame_loop;

pub use frame_loop::{FrameLoop, FrameLoopStats};

pub use paste::paste;

macro_rules! module_facade {
    ($name:ident) => {
        $crate::paste!{
            pub mod $name {
                pub use [<gears_ $name>]::*;
            }
        }
    };
}

module_facade!(core);
module_facade!(rhi);
module_facade!(rendergraph);
