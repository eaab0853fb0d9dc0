use thiserror::Error;

/// Errors raised by the post-training sparsifier.
#[derive(Error, Debug)]
pub enum SparsityError {
    #[error("Invalid sparsity configuration for field '{field}': {message}")]
    InvalidConfig { field: String, message: String },

    #[error("The sparsifier has no module groups, call prepare first")]
    NotPrepared,

    #[error("Masks have not been computed, call step before squash_mask")]
    NotStepped,

    #[error("Module '{name}' is not a weighted layer of the model")]
    UnknownModule { name: String },

    #[error(
        "Module '{name}' changed size since prepare: mask has {mask_len} elements, weight has {weight_len}"
    )]
    MaskSizeMismatch {
        name: String,
        mask_len: usize,
        weight_len: usize,
    },
}
