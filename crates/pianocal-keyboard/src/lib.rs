//! Keyboard coordinate frame for piano recordings.
//!
//! Four marked corners of the key span ([`KeyboardCorners`]) define a
//! homography from image pixels into *keyspace*, a unit square attached to
//! the keys. [`KeyboardFrame`] adds the 88-key partition of that square and
//! answers "which key is under this pixel".
//!
//! ```
//! use nalgebra::Point2;
//! use pianocal_keyboard::{KeyboardCorners, KeyboardFrame};
//!
//! let corners = KeyboardCorners::new(
//!     Point2::new(10.0, 10.0),
//!     Point2::new(110.0, 10.0),
//!     Point2::new(10.0, 60.0),
//!     Point2::new(110.0, 60.0),
//!     20.0,
//! )?;
//! let frame = KeyboardFrame::build(&corners, None)?;
//! assert_eq!(frame.key_index_at(Point2::new(10.5, 30.0)), Some(0));
//! # Ok::<(), pianocal_keyboard::FrameError>(())
//! ```

mod corners;
mod error;
mod frame;

pub use corners::{Corner, KeyboardCorners, BLACK_KEY_LENGTH_STEP, DEFAULT_DRAG_RADIUS};
pub use error::FrameError;
pub use frame::{KeyboardFrame, PixelSpace};
