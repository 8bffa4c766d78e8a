/*! CTF MEG Dataset Reader
 *
 * Pure Rust reader/writer for the files of a CTF MEG dataset (`*.ds` directory):
 *
 * - `.res4`: acquisition parameters, channel names, sensor geometry, filters and
 *   balancing coefficients ([`Res4`])
 * - `.meg4`: big-endian 32-bit samples laid out trial × channel × sample,
 *   memory mapped and scaled by the channel gains ([`Meg4`])
 * - `.acq`, `.infods`, `.rp`: CPersist ("WS1_") tagged containers ([`cpersist`])
 * - `.hc`: measured head-coil landmark positions ([`landmarks`])
 *
 * # Public API
 *
 * ## Core Functions
 * - [`Res4::read`] / [`Res4::write`]: Decode and re-encode a descriptor
 * - [`Meg4::open`]: Map the sample file described by a descriptor
 * - [`read_cpersist`] / [`decode`]: Decode a CPersist container
 * - [`read_hc_file`]: Read the nasion, left and right landmarks of one frame
 * - [`fit_rigid`]: Rotation and translation between two landmark triples
 * - [`head_motion`]: Head-frame track of one coil from the head-localization channels
 *
 * ## Data Structures
 * - [`ChannelInfo`]: Channel name, sensor type and gain
 * - [`Balancing`]: Resolved balancing coefficients of one sensor
 * - [`TaggedValue`]: Decoded CPersist value tree
 * - [`FidFrame`]: Fiducial (head) coordinate frame
 *
 * ## Constants
 * File magics, record sizes, sensor type codes (TYPE_*) and CPersist type codes
 * (CP_*) are re-exported from the [`constants`] module.
 *
 * ## Errors
 * Every fallible operation returns [`Result`] with the crate-wide [`Error`].
 */

// Submodules
pub mod constants;
pub mod cpersist;
pub mod error;
pub mod fid;
pub mod landmarks;
pub mod meg4;
pub mod res4;

// Re-exports: Public API
pub use constants::*;
pub use cpersist::{decode, decode_with, read_cpersist, DecodeOptions, TaggedValue};
pub use error::{Error, Result};
pub use fid::{fit_rigid, FidFrame, RigidFit};
pub use landmarks::{head_motion, read_hc, read_hc_file, Coil, Frame, Landmarks};
pub use meg4::{Meg4, OpenMode};
pub use res4::{
    friendly_name, Balancing, BalancingTerm, ChannelInfo, CoeffInfo, CoilRec, FilterInfo,
    FixedStr, GenRes, Res4, SensorRecord, SensorRes, SensorType,
};
