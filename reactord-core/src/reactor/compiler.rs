//! Compiles the declarations rendered for one event into an ordered list of
//! chunks ready for dispatch. Compilation is all-or-nothing per event: if
//! any declaration fails validation the whole reaction set is discarded, so
//! a partially-valid set is never dispatched.

use crate::reactor::renderer::ReactionSources;
use crate::reactor::{Backend, Chunk, Declaration};
use indexmap::IndexMap;
use serde_json::Value;
use std::collections::HashSet;
use tracing::{debug, error};

/// Renders every reaction reference, merges the results (later references
/// silently win name collisions), validates the merged declarations, and
/// orders them into chunks. Returns an empty list on any validation failure.
pub fn compile_reactions(
    sources: &ReactionSources,
    tag: &str,
    data: &Value,
    reactions: &[String],
) -> Vec<Chunk> {
    debug!(tag = %tag, "Compiling reactions for tag '{}'", tag);

    let mut merged: IndexMap<String, Declaration> = IndexMap::new();
    for reference in reactions {
        merged.extend(sources.render_reaction(reference, tag, data));
    }

    if merged.is_empty() {
        return Vec::new();
    }

    let errors = verify_declarations(&merged);
    if !errors.is_empty() {
        error!(
            tag = %tag,
            "Unable to compile reactions for event '{}' due to errors ({:?}) \
            in one or more of the reaction files ({:?})",
            tag, errors, reactions,
        );

        return Vec::new();
    }

    order_chunks(&merged)
}

/// Checks every declaration for a callable shape: a known backend, a
/// function to call, and requisites that resolve to declared names without
/// cycles. Returns one message per problem; an empty list means valid.
pub fn verify_declarations(declarations: &IndexMap<String, Declaration>) -> Vec<String> {
    let mut errors = Vec::new();

    for (name, declaration) in declarations {
        let source = declaration
            .source
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "<unknown>".to_string());

        if name.is_empty() {
            errors.push(format!("declaration in {} has an empty name", source));
            continue;
        }

        if Backend::from_state(&declaration.state).is_none() {
            errors.push(format!(
                "declaration '{}' in {} names the unknown backend '{}'",
                name, source, declaration.state,
            ));
        }

        if declaration.fun.is_empty() {
            errors.push(format!(
                "declaration '{}' in {} does not name a function to call",
                name, source,
            ));
        }

        for requisite in &declaration.require {
            if !declarations.contains_key(requisite) {
                errors.push(format!(
                    "declaration '{}' in {} requires the undeclared name '{}'",
                    name, source, requisite,
                ));
            }
        }
    }

    if errors.is_empty() {
        if let Some(name) = find_requisite_cycle(declarations) {
            errors.push(format!("requisite cycle detected involving '{}'", name));
        }
    }

    errors
}

/// Orders verified declarations into chunks: requisites execute before their
/// dependents, and declaration order in the merged mapping is the stable
/// tie-break. Ordering the same mapping twice yields the same sequence.
pub fn order_chunks(declarations: &IndexMap<String, Declaration>) -> Vec<Chunk> {
    let mut ordered = Vec::with_capacity(declarations.len());
    let mut visited = HashSet::new();

    for name in declarations.keys() {
        visit(name, declarations, &mut visited, &mut ordered);
    }

    ordered
}

fn visit(
    name: &str,
    declarations: &IndexMap<String, Declaration>,
    visited: &mut HashSet<String>,
    ordered: &mut Vec<Chunk>,
) {
    if visited.contains(name) {
        return;
    }

    visited.insert(name.to_string());

    let Some(declaration) = declarations.get(name) else {
        return;
    };

    for requisite in &declaration.require {
        if declarations.contains_key(requisite) {
            visit(requisite, declarations, visited, ordered);
        }
    }

    let Some(backend) = Backend::from_state(&declaration.state) else {
        return;
    };

    ordered.push(Chunk {
        name: name.to_string(),
        backend,
        fun: declaration.fun.clone(),
        args: declaration.args.clone(),
        kwargs: declaration.kwargs.clone(),
        target: declaration.target.clone(),
        source: declaration.source.clone(),
    });
}

fn find_requisite_cycle(declarations: &IndexMap<String, Declaration>) -> Option<String> {
    let mut finished = HashSet::new();
    let mut in_progress = HashSet::new();

    for name in declarations.keys() {
        if let Some(member) = cycle_from(name, declarations, &mut finished, &mut in_progress) {
            return Some(member);
        }
    }

    None
}

fn cycle_from(
    name: &str,
    declarations: &IndexMap<String, Declaration>,
    finished: &mut HashSet<String>,
    in_progress: &mut HashSet<String>,
) -> Option<String> {
    if finished.contains(name) {
        return None;
    }

    if in_progress.contains(name) {
        return Some(name.to_string());
    }

    in_progress.insert(name.to_string());

    if let Some(declaration) = declarations.get(name) {
        for requisite in &declaration.require {
            if declarations.contains_key(requisite) {
                if let Some(member) = cycle_from(requisite, declarations, finished, in_progress) {
                    return Some(member);
                }
            }
        }
    }

    in_progress.remove(name);
    finished.insert(name.to_string());
    None
}
