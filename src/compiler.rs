//! Compiler: elaborates a loaded [`crate::scenario::Scenario`] into an
//! immutable [`crate::flow::ProcessFlow`], per the six-step algorithm in the
//! design doc — parameter substitution, import expansion, step/group
//! instantiation, dependency wiring, cycle check, log directory resolution.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use petgraph::algo::toposort;
use tracing::{info, warn};

use crate::error::CompileError;
use crate::flow::{Graph, ProcessFlow};
use crate::model::{Dependency, Node, NodeKind, Step};
use crate::scenario::{self, Scenario, ScenarioNode};

/// A parsed `requires="a,!b"` entry, already namespace-qualified.
#[derive(Debug, Clone)]
struct Requirement {
    name: String,
    soft: bool,
}

#[derive(Debug, Clone)]
struct PendingStep {
    name: String,
    command: String,
    env: HashMap<String, String>,
    cwd: Option<PathBuf>,
    requires: Vec<Requirement>,
    if_predicate: Option<String>,
    unless_predicate: Option<String>,
    delay_seconds: u64,
    parent: Option<String>,
    order: usize,
}

#[derive(Debug, Clone)]
struct PendingGroup {
    name: String,
    requires: Vec<Requirement>,
    parent: Option<String>,
    order: usize,
}

#[derive(Debug, Clone)]
enum PendingNode {
    Step(PendingStep),
    Group(PendingGroup),
}

impl PendingNode {
    fn name(&self) -> &str {
        match self {
            PendingNode::Step(s) => &s.name,
            PendingNode::Group(g) => &g.name,
        }
    }

    fn parent(&self) -> Option<&str> {
        match self {
            PendingNode::Step(s) => s.parent.as_deref(),
            PendingNode::Group(g) => g.parent.as_deref(),
        }
    }

    fn own_requires(&self) -> &[Requirement] {
        match self {
            PendingNode::Step(s) => &s.requires,
            PendingNode::Group(g) => &g.requires,
        }
    }
}

/// A post-hoc `<dependency step="…" requires="…"/>` edge.
#[derive(Debug, Clone)]
struct Override {
    step: String,
    requires: Vec<Requirement>,
}

/// Namespaces `name` under `prefix`, if any.
fn ns(prefix: &Option<String>, name: &str) -> String {
    match prefix {
        Some(p) => format!("{p}.{name}"),
        None => name.to_string(),
    }
}

fn build_params(root: &ScenarioNode) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for parameters in root.children_named("parameters") {
        for param in parameters.children_named("param") {
            if let (Some(name), Some(value)) = (param.attr("name"), param.attr("value")) {
                params.insert(name.to_string(), value.to_string());
            }
        }
    }
    // Environment wins over declared defaults.
    let names: Vec<String> = params.keys().cloned().collect();
    for name in names {
        if let Ok(value) = std::env::var(&name) {
            params.insert(name, value);
        }
    }
    params
}

fn substitute_once(s: &str, params: &HashMap<String, String>) -> Result<(String, bool), CompileError> {
    let mut result = String::new();
    let mut changed = false;
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                let value = params
                    .get(name)
                    .ok_or_else(|| CompileError::UndefinedParameter { name: name.to_string() })?;
                result.push_str(value);
                changed = true;
                rest = &after[end + 1..];
            }
            None => {
                result.push_str(&rest[start..]);
                rest = "";
                break;
            }
        }
    }
    result.push_str(rest);
    Ok((result, changed))
}

/// Substitutes `${name}` references to a fixed point.
fn substitute(s: &str, params: &HashMap<String, String>) -> Result<String, CompileError> {
    let mut current = s.to_string();
    for _ in 0..64 {
        let (next, changed) = substitute_once(&current, params)?;
        if !changed || next == current {
            return Ok(next);
        }
        current = next;
    }
    Err(CompileError::ParameterCycle {
        attr: s.to_string(),
        value: current,
    })
}

fn parse_requires(raw: &str, namespace: &Option<String>, apply_namespace: bool) -> Vec<Requirement> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            let (soft, name) = match s.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, s),
            };
            let name = if apply_namespace { ns(namespace, name) } else { name.to_string() };
            Requirement { name, soft }
        })
        .collect()
}

fn parse_env(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|kv| {
            let mut parts = kv.splitn(2, '=');
            let key = parts.next()?.trim();
            let value = parts.next()?.trim();
            if key.is_empty() {
                None
            } else {
                Some((key.to_string(), value.to_string()))
            }
        })
        .collect()
}

/// Accumulates everything produced while walking one scenario document
/// (and, transitively, its imports) into flat, namespace-qualified lists.
struct Collector<'a> {
    nodes: Vec<PendingNode>,
    seen_names: HashSet<String>,
    overrides: Vec<Override>,
    order: usize,
    visiting_imports: &'a mut HashSet<PathBuf>,
}

impl<'a> Collector<'a> {
    fn push_node(&mut self, node: PendingNode) -> Result<(), CompileError> {
        if !self.seen_names.insert(node.name().to_string()) {
            return Err(CompileError::DuplicateName(node.name().to_string()));
        }
        self.nodes.push(node);
        Ok(())
    }

    fn walk_document(&mut self, scenario: &Scenario, namespace: Option<String>) -> Result<(), CompileError> {
        let params = build_params(&scenario.root);
        self.walk_children(&scenario.root, &namespace, None, &params, &scenario.base_dir)
    }

    fn walk_children(
        &mut self,
        node: &ScenarioNode,
        namespace: &Option<String>,
        parent: Option<String>,
        params: &HashMap<String, String>,
        base_dir: &Path,
    ) -> Result<(), CompileError> {
        for child in &node.children {
            match child.tag.as_str() {
                "parameters" => {}
                "step" => self.push_step(child, namespace, parent.clone(), params)?,
                "group" => self.push_group(child, namespace, parent.clone(), params, base_dir)?,
                "import" => self.expand_import(child, namespace, params, base_dir)?,
                "dependency" => {
                    let step = substitute(child.attr("step").unwrap_or_default(), params)?;
                    let requires_raw = substitute(child.attr("requires").unwrap_or_default(), params)?;
                    self.overrides.push(Override {
                        step: ns(namespace, &step),
                        requires: parse_requires(&requires_raw, namespace, true),
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn push_step(
        &mut self,
        node: &ScenarioNode,
        namespace: &Option<String>,
        parent: Option<String>,
        params: &HashMap<String, String>,
    ) -> Result<(), CompileError> {
        let raw_name = node.attr("name").ok_or_else(|| {
            CompileError::Scenario(crate::error::ScenarioError::MissingAttribute {
                path: PathBuf::new(),
                tag: "step".into(),
                attr: "name".into(),
            })
        })?;
        let name = ns(namespace, raw_name);
        let command = substitute(node.attr("exec").unwrap_or_default(), params)?;
        let env = match node.attr("env") {
            Some(raw) => parse_env(&substitute(raw, params)?),
            None => HashMap::new(),
        };
        let cwd = match node.attr("cwd") {
            Some(raw) => Some(PathBuf::from(substitute(raw, params)?)),
            None => None,
        };
        let requires = match node.attr("requires") {
            Some(raw) => parse_requires(&substitute(raw, params)?, namespace, true),
            None => Vec::new(),
        };
        let if_predicate = match node.attr("if") {
            Some(raw) => Some(substitute(raw, params)?),
            None => None,
        };
        let unless_predicate = match node.attr("unless") {
            Some(raw) => Some(substitute(raw, params)?),
            None => None,
        };
        let delay_seconds = match node.attr("delay") {
            Some(raw) => substitute(raw, params)?
                .parse()
                .unwrap_or(0),
            None => 0,
        };

        self.order += 1;
        self.push_node(PendingNode::Step(PendingStep {
            name,
            command,
            env,
            cwd,
            requires,
            if_predicate,
            unless_predicate,
            delay_seconds,
            parent,
            order: self.order,
        }))
    }

    fn push_group(
        &mut self,
        node: &ScenarioNode,
        namespace: &Option<String>,
        parent: Option<String>,
        params: &HashMap<String, String>,
        base_dir: &Path,
    ) -> Result<(), CompileError> {
        let raw_name = node.attr("name").ok_or_else(|| {
            CompileError::Scenario(crate::error::ScenarioError::MissingAttribute {
                path: PathBuf::new(),
                tag: "group".into(),
                attr: "name".into(),
            })
        })?;
        let name = ns(namespace, raw_name);
        let requires = match node.attr("requires") {
            Some(raw) => parse_requires(&substitute(raw, params)?, namespace, true),
            None => Vec::new(),
        };

        self.order += 1;
        self.push_node(PendingNode::Group(PendingGroup {
            name: name.clone(),
            requires,
            parent,
            order: self.order,
        }))?;

        self.walk_children(node, namespace, Some(name), params, base_dir)
    }

    fn expand_import(
        &mut self,
        node: &ScenarioNode,
        namespace: &Option<String>,
        params: &HashMap<String, String>,
        base_dir: &Path,
    ) -> Result<(), CompileError> {
        let file = node.attr("file").ok_or_else(|| {
            CompileError::Scenario(crate::error::ScenarioError::MissingAttribute {
                path: PathBuf::new(),
                tag: "import".into(),
                attr: "file".into(),
            })
        })?;
        let file = substitute(file, params)?;
        let import_path = base_dir.join(file);
        let canon = import_path.canonicalize().unwrap_or_else(|_| import_path.clone());

        if self.visiting_imports.contains(&canon) {
            return Err(CompileError::ImportCycle(canon.display().to_string()));
        }

        let local_namespace = match node.attr("namespace") {
            Some(raw) => Some(substitute(raw, params)?),
            None => None,
        };
        let combined_namespace = match (namespace, &local_namespace) {
            (Some(outer), Some(inner)) => Some(format!("{outer}.{inner}")),
            (Some(outer), None) => Some(outer.clone()),
            (None, Some(inner)) => Some(inner.clone()),
            (None, None) => None,
        };

        let imported = scenario::load(&import_path).map_err(|e| CompileError::ImportIo {
            path: import_path.clone(),
            source: Box::new(e),
        })?;

        self.visiting_imports.insert(canon.clone());
        self.walk_document(&imported, combined_namespace)?;
        self.visiting_imports.remove(&canon);

        for dep in node.children_named("dependency") {
            let step = substitute(dep.attr("step").unwrap_or_default(), params)?;
            let requires_raw = substitute(dep.attr("requires").unwrap_or_default(), params)?;
            self.overrides.push(Override {
                step,
                requires: parse_requires(&requires_raw, &None, false),
            });
        }

        Ok(())
    }
}

/// Compiles `scenario` into an immutable [`ProcessFlow`] plus its resolved
/// log directory. Fails fast: any error here means no flow is produced.
pub fn compile(scenario: &Scenario) -> Result<(ProcessFlow, PathBuf), CompileError> {
    let mut visiting_imports = HashSet::new();

    let mut collector = Collector {
        nodes: Vec::new(),
        seen_names: HashSet::new(),
        overrides: Vec::new(),
        order: 0,
        visiting_imports: &mut visiting_imports,
    };
    collector.walk_document(scenario, None)?;

    let Collector { nodes, overrides, .. } = collector;

    let flow = build_graph(nodes, overrides)?;
    let log_dir = scenario.base_dir.join("logs").join(&scenario.name);

    info!(
        scenario = %scenario.name,
        steps = flow.steps().count(),
        log_dir = %log_dir.display(),
        "compiled scenario"
    );

    Ok((flow, log_dir))
}

fn build_graph(nodes: Vec<PendingNode>, overrides: Vec<Override>) -> Result<ProcessFlow, CompileError> {
    let mut graph: Graph = Graph::new();
    let mut by_name = HashMap::new();

    for pending in &nodes {
        let kind = match pending {
            PendingNode::Step(s) => NodeKind::Atomic(Step {
                name: s.name.clone(),
                command: s.command.clone(),
                env: s.env.clone(),
                cwd: s.cwd.clone(),
                if_predicate: s.if_predicate.clone(),
                unless_predicate: s.unless_predicate.clone(),
                delay_seconds: s.delay_seconds,
            }),
            PendingNode::Group(_) => NodeKind::Composite { children: Vec::new() },
        };
        let order = match pending {
            PendingNode::Step(s) => s.order,
            PendingNode::Group(g) => g.order,
        };
        let idx = graph.add_node(Node {
            name: pending.name().to_string(),
            kind,
            parent: None,
            declaration_order: order,
        });
        by_name.insert(pending.name().to_string(), idx);
    }

    // Link parent/child pointers.
    for pending in &nodes {
        if let Some(parent_name) = pending.parent() {
            let parent_idx = *by_name
                .get(parent_name)
                .ok_or_else(|| CompileError::UnresolvedDependency {
                    dependent: pending.name().to_string(),
                    required: parent_name.to_string(),
                })?;
            let child_idx = by_name[pending.name()];
            graph[child_idx].parent = Some(parent_idx);
            if let NodeKind::Composite { children } = &mut graph[parent_idx].kind {
                children.push(child_idx);
            }
        }
    }

    // Resolve each node's effective requires: its own, plus every ancestor
    // group's own requires, transitively.
    let by_name_snapshot: HashMap<String, PendingNode> =
        nodes.into_iter().map(|n| (n.name().to_string(), n)).collect();

    for (name, pending) in &by_name_snapshot {
        let dependent_idx = by_name[name];
        let mut effective = pending.own_requires().to_vec();

        let mut ancestor = pending.parent().map(str::to_string);
        while let Some(group_name) = ancestor {
            let group = &by_name_snapshot[&group_name];
            effective.extend(group.own_requires().iter().cloned());
            ancestor = group.parent().map(str::to_string);
        }

        for req in effective {
            let prereq_idx = *by_name
                .get(&req.name)
                .ok_or_else(|| CompileError::UnresolvedDependency {
                    dependent: name.clone(),
                    required: req.name.clone(),
                })?;
            graph.update_edge(prereq_idx, dependent_idx, Dependency { soft: req.soft });
        }
    }

    for over in overrides {
        let dependent_idx = *by_name
            .get(&over.step)
            .ok_or_else(|| CompileError::UnresolvedDependency {
                dependent: over.step.clone(),
                required: over.step.clone(),
            })?;
        for req in over.requires {
            match by_name.get(&req.name) {
                Some(&prereq_idx) => {
                    graph.update_edge(prereq_idx, dependent_idx, Dependency { soft: req.soft });
                }
                None => {
                    return Err(CompileError::UnresolvedDependency {
                        dependent: over.step.clone(),
                        required: req.name,
                    })
                }
            }
        }
    }

    check_acyclic(&graph)?;

    Ok(ProcessFlow::new(graph, by_name))
}

fn check_acyclic(graph: &Graph) -> Result<(), CompileError> {
    if let Err(cycle) = toposort(graph, None) {
        let cycle_names = reconstruct_cycle(graph, cycle.node_id());
        warn!(cycle = ?cycle_names, "dependency cycle detected");
        return Err(CompileError::Cycle(cycle_names.join(" -> ")));
    }
    Ok(())
}

/// DFS from `start` following outgoing edges until a repeated node is found,
/// returning the names along that cycle.
fn reconstruct_cycle(graph: &Graph, start: petgraph::graph::NodeIndex) -> Vec<String> {
    let mut stack = vec![start];
    let mut path = Vec::new();
    let mut on_stack = HashMap::new();

    loop {
        let current = *stack.last().unwrap();
        if let Some(&pos) = on_stack.get(&current) {
            return path[pos..]
                .iter()
                .map(|&idx| graph[idx].name.clone())
                .chain(std::iter::once(graph[current].name.clone()))
                .collect();
        }
        on_stack.insert(current, path.len());
        path.push(current);

        match graph.neighbors(current).next() {
            Some(next) => stack.push(next),
            None => return vec![graph[current].name.clone()],
        }
    }
}
