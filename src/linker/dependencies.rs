//! Barrier-count propagation along kernel → function call edges

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::program::{ExternalFunctionInfo, FunctionDependency, KernelDependency};

/// Result of walking call edges against a function table
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DependencyResolution {
    /// Highest barrier count reachable from each kernel
    pub kernel_barriers: BTreeMap<String, u8>,
    /// Edges with at least one reachable function missing from the table
    pub unresolved: Vec<KernelDependency>,
    /// Names of the missing functions
    pub missing_functions: BTreeSet<String>,
}

/// Walk every kernel edge through `function_dependencies`, taking the max
/// barrier count of each reachable function. Cycles terminate.
pub fn resolve_function_dependencies<'a>(
    kernel_dependencies: &[KernelDependency],
    function_dependencies: &[FunctionDependency],
    functions: impl IntoIterator<Item = &'a ExternalFunctionInfo>,
) -> DependencyResolution {
    let table: HashMap<&str, &ExternalFunctionInfo> =
        functions.into_iter().map(|f| (f.name.as_str(), f)).collect();

    let mut callees: HashMap<&str, Vec<&str>> = HashMap::new();
    for dep in function_dependencies {
        callees
            .entry(dep.caller.as_str())
            .or_default()
            .push(dep.used_function.as_str());
    }

    let mut resolution = DependencyResolution::default();
    for edge in kernel_dependencies {
        let mut visited = BTreeSet::new();
        let mut stack = vec![edge.used_function.as_str()];
        let mut barrier = 0u8;
        let mut missing = false;

        while let Some(name) = stack.pop() {
            if !visited.insert(name) {
                continue;
            }
            match table.get(name) {
                Some(info) => barrier = barrier.max(info.barrier_count),
                None => {
                    missing = true;
                    resolution.missing_functions.insert(name.to_string());
                }
            }
            if let Some(next) = callees.get(name) {
                stack.extend(next.iter().copied());
            }
        }

        if missing {
            resolution.unresolved.push(edge.clone());
        } else {
            let entry = resolution
                .kernel_barriers
                .entry(edge.kernel_name.clone())
                .or_insert(0);
            *entry = (*entry).max(barrier);
        }
    }
    resolution
}
