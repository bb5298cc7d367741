mod entries;
mod helpers;
mod stats;

pub(crate) use entries::{LogArgs, cmd_delete, cmd_list, cmd_log};
pub(crate) use stats::{cmd_anchors, cmd_digest, cmd_stats};
