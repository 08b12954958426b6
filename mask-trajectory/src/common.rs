pub use anyhow::{bail, ensure, format_err, Context as _, Error, Result};
pub use derivative::Derivative;
pub use indexmap::{IndexMap, IndexSet};
pub use itertools::{izip, Itertools as _};
pub use log::{debug, info, warn};
pub use ndarray::{Array2, Array3, ArrayView2, Axis};
pub use noisy_float::prelude::*;
pub use once_cell::sync::Lazy;
pub use rand::{prelude::*, rngs::StdRng};
pub use regex::Regex;
pub use serde::{Deserialize, Serialize};
pub use std::{
    borrow::Borrow,
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    fmt::Debug,
    fs,
    iter,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
pub use tch::{
    kind::FLOAT_CPU,
    nn::{self, OptimizerConfig as _},
    Device, Kind, Reduction, Tensor,
};
pub use tch_act::{Activation, TensorActivationExt as _};

pub type Fallible<T> = Result<T, Error>;
