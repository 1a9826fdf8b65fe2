// Hierarchical names for submodules created by rewrites

/// Middle segment of every fused Conv+BatchNorm submodule path
pub const FUSED_CONV_BN_PREFIX: &str = "fake_conv_bn";

/// Parent container path of a dotted module path
///
/// `"layer1.0.conv1"` → `"layer1.0"`, `"conv"` → `""`.
pub fn module_space(path: &str) -> &str {
    path.rsplit_once('.').map_or("", |(parent, _)| parent)
}

/// Path for the `counter`-th fused block, nested next to `path`
pub fn fused_module_name(path: &str, counter: usize) -> String {
    match module_space(path) {
        "" => format!("{}.{}", FUSED_CONV_BN_PREFIX, counter),
        parent => format!("{}.{}.{}", parent, FUSED_CONV_BN_PREFIX, counter),
    }
}
