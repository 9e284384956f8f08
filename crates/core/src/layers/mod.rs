pub mod attention;
pub mod mlp;

pub use attention::{AttentionOutput, TokenAttention, VitAttention, METRIC_KEY};
pub use mlp::{quick_gelu, Activation, VitMlp};
