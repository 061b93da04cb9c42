//! Control-flow leakage: every trace is merged into one shared call tree
//! that only diverges (splits) where the entries actually differ. Each
//! split point records which testcases took which side; instructions whose
//! splits partition the testcases in two or more distinct ways are reported
//! as leaking.
//!
//! The tree is arena-allocated and walked with explicit work stacks; call
//! trees get deep enough that recursion is not an option.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use log::{info, warn};

use crate::analysis::{AnalysisOptions, Analyzer};
use crate::core::types::{
    block_address_id, image_address_id, instruction_id, BranchKind, TestcaseId, TraceEntry,
    ROOT_STACK_ID,
};
use crate::report;
use crate::symbols::SymbolResolver;
use crate::trace::TraceFile;
use crate::util::hash::branch_stack_id;
use crate::util::seq::format_ids;
use crate::util::testcase_set::TestcaseIdSet;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct NodeIndex(u32);

#[derive(Default)]
pub(crate) struct SplitData {
    pub(crate) testcases: TestcaseIdSet,
    /// Consumed in order by every testcase that reaches this node.
    pub(crate) successors: Vec<NodeIndex>,
    /// After the successors, control moves into exactly one of these.
    pub(crate) split_successors: Vec<NodeIndex>,
}

pub(crate) enum Node {
    Root(SplitData),
    Split(SplitData),
    Call {
        split: SplitData,
        source: u64,
        target: u64,
        stack_id: u64,
    },
    Branch {
        source: u64,
        target: u64,
        taken: bool,
    },
    Return {
        source: u64,
        target: u64,
    },
    Memory {
        instruction: u64,
        is_write: bool,
        /// target address id -> testcases whose access matched it here.
        targets: BTreeMap<u64, TestcaseIdSet>,
    },
    Allocation {
        heap: bool,
        block_id: i32,
        size: u32,
    },
}

impl Node {
    fn split_data(&self) -> Option<&SplitData> {
        match self {
            Node::Root(data) | Node::Split(data) | Node::Call { split: data, .. } => Some(data),
            _ => None,
        }
    }

    fn split_data_mut(&mut self) -> Option<&mut SplitData> {
        match self {
            Node::Root(data) | Node::Split(data) | Node::Call { split: data, .. } => Some(data),
            _ => None,
        }
    }

    /// The instruction that produced this node, used to attribute splits.
    fn head_instruction(&self) -> Option<u64> {
        match *self {
            Node::Call { source, .. }
            | Node::Branch { source, .. }
            | Node::Return { source, .. } => Some(source),
            Node::Memory { instruction, .. } => Some(instruction),
            Node::Root(_) | Node::Split(_) | Node::Allocation { .. } => None,
        }
    }
}

pub(crate) struct CallTree {
    nodes: Vec<Node>,
}

impl CallTree {
    const ROOT: NodeIndex = NodeIndex(0);

    fn new() -> CallTree {
        CallTree {
            nodes: vec![Node::Root(SplitData::default())],
        }
    }

    fn node(&self, index: NodeIndex) -> &Node {
        &self.nodes[index.0 as usize]
    }

    fn node_mut(&mut self, index: NodeIndex) -> &mut Node {
        &mut self.nodes[index.0 as usize]
    }

    fn push(&mut self, node: Node) -> NodeIndex {
        self.nodes.push(node);
        NodeIndex((self.nodes.len() - 1) as u32)
    }

    fn split_data(&self, index: NodeIndex) -> &SplitData {
        self.node(index)
            .split_data()
            .expect("cursor node is split-bearing")
    }

    fn split_data_mut(&mut self, index: NodeIndex) -> &mut SplitData {
        self.node_mut(index)
            .split_data_mut()
            .expect("cursor node is split-bearing")
    }
}

/// What one incoming trace entry proposes to integrate into the tree.
enum Proposal {
    Call { source: u64, target: u64, stack_id: u64 },
    Branch { source: u64, target: u64, taken: bool },
    Return { source: u64, target: u64 },
    Memory { instruction: u64, is_write: bool, address: u64 },
    Allocation { heap: bool, block_id: i32, size: u32 },
}

fn node_matches(node: &Node, proposal: &Proposal) -> bool {
    match (node, proposal) {
        (
            Node::Call { source, target, .. },
            Proposal::Call {
                source: ps,
                target: pt,
                ..
            },
        ) => source == ps && target == pt,
        (
            Node::Branch {
                source,
                target,
                taken,
            },
            Proposal::Branch {
                source: ps,
                target: pt,
                taken: ptaken,
            },
        ) => source == ps && target == pt && taken == ptaken,
        (
            Node::Return { source, target },
            Proposal::Return {
                source: ps,
                target: pt,
            },
        ) => source == ps && target == pt,
        // Memory accesses match on the instruction alone; divergent target
        // addresses accumulate in the node instead of splitting the tree.
        (
            Node::Memory { instruction, .. },
            Proposal::Memory {
                instruction: pi, ..
            },
        ) => instruction == pi,
        (
            Node::Allocation { heap, block_id, .. },
            Proposal::Allocation {
                heap: ph,
                block_id: pb,
                ..
            },
        ) => heap == ph && block_id == pb,
        _ => false,
    }
}

fn create_node(proposal: &Proposal, testcase_id: TestcaseId) -> Node {
    match *proposal {
        Proposal::Call {
            source,
            target,
            stack_id,
        } => Node::Call {
            split: SplitData {
                testcases: TestcaseIdSet::singleton(testcase_id),
                ..SplitData::default()
            },
            source,
            target,
            stack_id,
        },
        Proposal::Branch {
            source,
            target,
            taken,
        } => Node::Branch {
            source,
            target,
            taken,
        },
        Proposal::Return { source, target } => Node::Return { source, target },
        Proposal::Memory {
            instruction,
            is_write,
            address,
        } => {
            let mut targets = BTreeMap::new();
            targets.insert(address, TestcaseIdSet::singleton(testcase_id));
            Node::Memory {
                instruction,
                is_write,
                targets,
            }
        }
        Proposal::Allocation {
            heap,
            block_id,
            size,
        } => Node::Allocation {
            heap,
            block_id,
            size,
        },
    }
}

/// Adds the testcase to the sets a matched node carries.
fn add_to_matched(tree: &mut CallTree, index: NodeIndex, proposal: &Proposal, id: TestcaseId) {
    match (tree.node_mut(index), proposal) {
        (Node::Call { split, .. }, _) => split.testcases.add(id),
        (Node::Memory { targets, .. }, Proposal::Memory { address, .. }) => {
            targets.entry(*address).or_default().add(id);
        }
        _ => {}
    }
}

/// Per-trace insertion state.
struct InsertCursor {
    testcase_id: TestcaseId,
    current: NodeIndex,
    successor_index: usize,
    node_stack: Vec<(NodeIndex, usize)>,
    stack_id: u64,
    stack_ids: Vec<u64>,
}

impl InsertCursor {
    fn new(testcase_id: TestcaseId) -> InsertCursor {
        InsertCursor {
            testcase_id,
            current: CallTree::ROOT,
            successor_index: 0,
            node_stack: Vec::new(),
            stack_id: ROOT_STACK_ID,
            stack_ids: Vec::new(),
        }
    }

    /// Moves past an integrated node: descend into calls, pop on returns,
    /// step forward otherwise.
    fn advance(
        &mut self,
        tree: &CallTree,
        node: NodeIndex,
        container: NodeIndex,
        index_after: usize,
        proposal: &Proposal,
    ) {
        match proposal {
            Proposal::Call { stack_id, .. } => {
                self.node_stack.push((container, index_after));
                self.stack_ids.push(self.stack_id);
                self.current = node;
                self.successor_index = 0;
                self.stack_id = *stack_id;
            }
            Proposal::Return { .. } => match (self.node_stack.pop(), self.stack_ids.pop()) {
                (Some((resume_node, resume_index)), Some(stack_id)) => {
                    self.current = resume_node;
                    self.successor_index = resume_index;
                    self.stack_id = stack_id;
                }
                _ => {
                    warn!(
                        "testcase {}: return with empty call stack, continuing at root",
                        self.testcase_id
                    );
                    self.current = CallTree::ROOT;
                    self.successor_index = tree.split_data(CallTree::ROOT).successors.len();
                    self.stack_id = ROOT_STACK_ID;
                }
            },
            _ => {
                self.current = container;
                self.successor_index = index_after;
            }
        }
    }
}

/// The in-place split: everything from `index` on, plus the existing split
/// successors, moves into `split1` (all other testcases); the diverging
/// testcase continues alone in `split2`.
fn split_at(
    tree: &mut CallTree,
    parent: NodeIndex,
    index: usize,
    testcase_id: TestcaseId,
    proposal: &Proposal,
) -> NodeIndex {
    let (moved_successors, moved_splits, remaining_set) = {
        let data = tree.split_data_mut(parent);
        let moved = data.successors.split_off(index);
        let splits = std::mem::take(&mut data.split_successors);
        let set = data.testcases.without(testcase_id);
        (moved, splits, set)
    };
    let split1 = tree.push(Node::Split(SplitData {
        testcases: remaining_set,
        successors: moved_successors,
        split_successors: moved_splits,
    }));
    let node = create_node(proposal, testcase_id);
    let node = tree.push(node);
    let split2 = tree.push(Node::Split(SplitData {
        testcases: TestcaseIdSet::singleton(testcase_id),
        successors: vec![node],
        split_successors: Vec::new(),
    }));
    let data = tree.split_data_mut(parent);
    data.split_successors.push(split1);
    data.split_successors.push(split2);
    split2
}

#[derive(Clone, Copy)]
struct BranchStackRecord {
    parent: u64,
    source: u64,
    target: u64,
}

#[derive(Default)]
struct ControlFlowState {
    tree: CallTree,
    stack_records: HashMap<u64, BranchStackRecord>,
    last_testcase: Option<TestcaseId>,
}

impl Default for CallTree {
    fn default() -> CallTree {
        CallTree::new()
    }
}

fn integrate(state: &mut ControlFlowState, cursor: &mut InsertCursor, proposal: Proposal) {
    let tree = &mut state.tree;

    if cursor.successor_index < tree.split_data(cursor.current).successors.len() {
        let successor = tree.split_data(cursor.current).successors[cursor.successor_index];
        if node_matches(tree.node(successor), &proposal) {
            add_to_matched(tree, successor, &proposal, cursor.testcase_id);
            cursor.advance(
                tree,
                successor,
                cursor.current,
                cursor.successor_index + 1,
                &proposal,
            );
        } else {
            let split2 = split_at(
                tree,
                cursor.current,
                cursor.successor_index,
                cursor.testcase_id,
                &proposal,
            );
            let head = tree.split_data(split2).successors[0];
            cursor.advance(tree, head, split2, 1, &proposal);
        }
        return;
    }

    // End of the successor list.
    if tree.split_data(cursor.current).testcases.count() <= 1 {
        // This path is exclusively ours: extend it.
        let node = tree.push(create_node(&proposal, cursor.testcase_id));
        tree.split_data_mut(cursor.current).successors.push(node);
        cursor.advance(
            tree,
            node,
            cursor.current,
            cursor.successor_index + 1,
            &proposal,
        );
        return;
    }

    if tree.split_data(cursor.current).split_successors.is_empty() {
        // Other testcases ended exactly here without diverging first; only
        // malformed traces get us here.
        warn!(
            "testcase {}: divergence at a node where earlier testcases ended without a split",
            cursor.testcase_id
        );
    }

    let matched = tree
        .split_data(cursor.current)
        .split_successors
        .iter()
        .copied()
        .find(|&split| {
            tree.split_data(split)
                .successors
                .first()
                .map_or(false, |&head| node_matches(tree.node(head), &proposal))
        });
    match matched {
        Some(split) => {
            tree.split_data_mut(split).testcases.add(cursor.testcase_id);
            let head = tree.split_data(split).successors[0];
            add_to_matched(tree, head, &proposal, cursor.testcase_id);
            cursor.advance(tree, head, split, 1, &proposal);
        }
        None => {
            let node = tree.push(create_node(&proposal, cursor.testcase_id));
            let split = tree.push(Node::Split(SplitData {
                testcases: TestcaseIdSet::singleton(cursor.testcase_id),
                successors: vec![node],
                split_successors: Vec::new(),
            }));
            tree.split_data_mut(cursor.current).split_successors.push(split);
            cursor.advance(tree, node, split, 1, &proposal);
        }
    }
}

fn insert_entry(state: &mut ControlFlowState, cursor: &mut InsertCursor, entry: &TraceEntry) {
    let proposal = match *entry {
        TraceEntry::Branch {
            taken: true,
            kind: BranchKind::Call,
            source_image_id,
            source_offset,
            destination_image_id,
            destination_offset,
        } => {
            let source = instruction_id(source_image_id, source_offset);
            let target = instruction_id(destination_image_id, destination_offset);
            let stack_id = branch_stack_id(cursor.stack_id, source, target);
            state
                .stack_records
                .entry(stack_id)
                .or_insert(BranchStackRecord {
                    parent: cursor.stack_id,
                    source,
                    target,
                });
            Proposal::Call {
                source,
                target,
                stack_id,
            }
        }
        TraceEntry::Branch {
            kind: BranchKind::Return,
            source_image_id,
            source_offset,
            destination_image_id,
            destination_offset,
            ..
        } => Proposal::Return {
            source: instruction_id(source_image_id, source_offset),
            target: instruction_id(destination_image_id, destination_offset),
        },
        TraceEntry::Branch {
            taken,
            source_image_id,
            source_offset,
            destination_image_id,
            destination_offset,
            ..
        } => Proposal::Branch {
            source: instruction_id(source_image_id, source_offset),
            // The destination of an untaken branch is meaningless.
            target: if taken {
                instruction_id(destination_image_id, destination_offset)
            } else {
                0
            },
            taken,
        },
        TraceEntry::ImageMemoryAccess {
            is_write,
            instruction_image_id,
            instruction_offset,
            memory_image_id,
            memory_offset,
            ..
        } => Proposal::Memory {
            instruction: instruction_id(instruction_image_id, instruction_offset),
            is_write,
            address: image_address_id(memory_image_id, memory_offset),
        },
        TraceEntry::HeapMemoryAccess {
            is_write,
            instruction_image_id,
            instruction_offset,
            heap_block_id,
            memory_offset,
            ..
        } => Proposal::Memory {
            instruction: instruction_id(instruction_image_id, instruction_offset),
            is_write,
            address: block_address_id(heap_block_id, memory_offset),
        },
        TraceEntry::StackMemoryAccess {
            is_write,
            instruction_image_id,
            instruction_offset,
            stack_block_id,
            memory_offset,
            ..
        } => Proposal::Memory {
            instruction: instruction_id(instruction_image_id, instruction_offset),
            is_write,
            address: block_address_id(stack_block_id, memory_offset),
        },
        TraceEntry::HeapAllocation { id, size, .. } => Proposal::Allocation {
            heap: true,
            block_id: id,
            size,
        },
        TraceEntry::StackAllocation { id, size, .. } => Proposal::Allocation {
            heap: false,
            block_id: id,
            size,
        },
        TraceEntry::HeapFree { .. } => return,
    };
    integrate(state, cursor, proposal);
}

/// Collects, per (call-stack id, instruction id), the set hashes of every
/// split the instruction caused anywhere in the tree.
fn collect_split_hashes(tree: &CallTree) -> HashMap<(u64, u64), HashSet<u64>> {
    let mut result: HashMap<(u64, u64), HashSet<u64>> = HashMap::new();
    let mut work: Vec<(NodeIndex, u64)> = vec![(CallTree::ROOT, ROOT_STACK_ID)];
    while let Some((index, context)) = work.pop() {
        let node = tree.node(index);
        let data = match node.split_data() {
            Some(data) => data,
            None => continue,
        };
        let child_context = match node {
            Node::Call { stack_id, .. } => *stack_id,
            _ => context,
        };
        for &split in &data.split_successors {
            let split_data = tree.split_data(split);
            if let Some(&head) = split_data.successors.first() {
                if let Some(instruction) = tree.node(head).head_instruction() {
                    result
                        .entry((child_context, instruction))
                        .or_default()
                        .insert(split_data.testcases.hash64());
                }
            }
        }
        for &child in data.successors.iter().chain(data.split_successors.iter()) {
            work.push((child, child_context));
        }
    }
    result
}

pub struct ControlFlowLeakageAnalyzer {
    options: AnalysisOptions,
    resolver: Arc<SymbolResolver>,
    state: Mutex<ControlFlowState>,
}

impl ControlFlowLeakageAnalyzer {
    pub fn new(options: AnalysisOptions, resolver: Arc<SymbolResolver>) -> Self {
        ControlFlowLeakageAnalyzer {
            options,
            resolver,
            state: Mutex::new(ControlFlowState::default()),
        }
    }

    /// `source -> target` hops from the leaf call to the root.
    fn stack_labels(&self, state: &ControlFlowState, mut stack_id: u64) -> Vec<String> {
        let mut labels = Vec::new();
        while stack_id != ROOT_STACK_ID {
            match state.stack_records.get(&stack_id) {
                Some(record) => {
                    labels.push(format!(
                        "{} -> {}",
                        self.resolver.format_instruction(record.source),
                        self.resolver.format_instruction(record.target)
                    ));
                    stack_id = record.parent;
                }
                None => {
                    labels.push(format!("<unknown CS-{:016X}>", stack_id));
                    break;
                }
            }
        }
        labels
    }

    fn write_tree_dump(&self, dir: &std::path::Path, state: &ControlFlowState) -> Result<()> {
        let tree = &state.tree;
        let mut out = report::open_report(dir, "call-tree-dump.txt")?;
        let mut work: Vec<(NodeIndex, usize)> = vec![(CallTree::ROOT, 0)];
        while let Some((index, depth)) = work.pop() {
            let pad = "  ".repeat(depth);
            let node = tree.node(index);
            let child_depth = match node {
                Node::Call { .. } => depth + 1,
                _ => depth,
            };
            match node {
                Node::Root(data) => {
                    writeln!(out, "{}@root [{}]", pad, format_ids(data.testcases.iter()))?;
                }
                Node::Split(data) => {
                    writeln!(out, "{}@split [{}]", pad, format_ids(data.testcases.iter()))?;
                }
                Node::Call {
                    split,
                    source,
                    target,
                    stack_id,
                } => {
                    writeln!(
                        out,
                        "{}#call {} -> {} ($CS-{:016X}) [{}]",
                        pad,
                        self.resolver.format_instruction(*source),
                        self.resolver.format_instruction(*target),
                        stack_id,
                        format_ids(split.testcases.iter())
                    )?;
                }
                Node::Branch {
                    source,
                    target,
                    taken,
                } => {
                    if *taken {
                        writeln!(
                            out,
                            "{}#branch {} -> {}",
                            pad,
                            self.resolver.format_instruction(*source),
                            self.resolver.format_instruction(*target)
                        )?;
                    } else {
                        writeln!(
                            out,
                            "{}#branch {} not taken",
                            pad,
                            self.resolver.format_instruction(*source)
                        )?;
                    }
                }
                Node::Return { source, target } => {
                    writeln!(
                        out,
                        "{}#return {} -> {}",
                        pad,
                        self.resolver.format_instruction(*source),
                        self.resolver.format_instruction(*target)
                    )?;
                }
                Node::Memory {
                    instruction,
                    is_write,
                    targets,
                } => {
                    writeln!(
                        out,
                        "{}#memory {} {}",
                        pad,
                        self.resolver.format_instruction(*instruction),
                        if *is_write { "writes" } else { "reads" }
                    )?;
                    for (address, testcases) in targets {
                        writeln!(
                            out,
                            "{}  {}: [{}]",
                            pad,
                            self.resolver.format_address(*address),
                            format_ids(testcases.iter())
                        )?;
                    }
                }
                Node::Allocation {
                    heap,
                    block_id,
                    size,
                } => {
                    writeln!(
                        out,
                        "{}#allocation {} block {} size {}",
                        pad,
                        if *heap { "heap" } else { "stack" },
                        block_id,
                        size
                    )?;
                }
            }
            if let Some(data) = node.split_data() {
                for &child in data
                    .split_successors
                    .iter()
                    .rev()
                    .chain(data.successors.iter().rev())
                {
                    work.push((child, child_depth));
                }
            }
        }
        out.flush()?;
        Ok(())
    }
}

impl Analyzer for ControlFlowLeakageAnalyzer {
    fn name(&self) -> &'static str {
        "control-flow-leakage"
    }

    /// Ingest mutates the shared tree in place, so traces must arrive one
    /// at a time, in ascending testcase order.
    fn is_parallel_safe(&self) -> bool {
        false
    }

    fn add_trace(&self, testcase_id: TestcaseId, trace: &TraceFile) -> Result<()> {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        if let Some(last) = state.last_testcase {
            if testcase_id <= last {
                warn!(
                    "control-flow-leakage expects ascending testcase ids, got {} after {}",
                    testcase_id, last
                );
            }
        }
        state.last_testcase = Some(testcase_id);
        state
            .tree
            .split_data_mut(CallTree::ROOT)
            .testcases
            .add(testcase_id);

        let mut cursor = InsertCursor::new(testcase_id);
        let mut entries = trace
            .stream_with_prefix()
            .with_context(|| format!("failed to open trace of testcase {}", testcase_id))?;
        loop {
            let entry = entries
                .next_entry()
                .with_context(|| format!("failed to decode trace of testcase {}", testcase_id))?;
            match entry {
                Some(entry) => insert_entry(state, &mut cursor, entry),
                None => break,
            }
        }
        if !cursor.node_stack.is_empty() {
            warn!(
                "testcase {}: {} call(s) without a matching return at end of trace",
                testcase_id,
                cursor.node_stack.len()
            );
        }
        Ok(())
    }

    fn finish(&self) -> Result<()> {
        let state = self.state.lock().unwrap();
        let dir = self.options.output_directory.join(self.name());
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create output directory {}", dir.display()))?;

        let hashes = collect_split_hashes(&state.tree);
        let mut leaking: Vec<((u64, u64), usize)> = hashes
            .iter()
            .filter(|(_, hashes)| hashes.len() >= 2)
            .map(|(&key, hashes)| (key, hashes.len()))
            .collect();
        leaking.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let mut out = report::open_report(&dir, "instructions.txt")?;
        for &((stack, instruction), count) in &leaking {
            writeln!(
                out,
                "CS-{:016X} {}: {} unique hashes",
                stack,
                self.resolver.format_instruction(instruction),
                count
            )?;
        }
        out.flush()?;

        if self.options.cancel.load(std::sync::atomic::Ordering::Relaxed) {
            warn!("cancellation requested, leaving remaining reports unwritten");
            return Ok(());
        }

        let interesting: HashSet<u64> = leaking.iter().map(|&((stack, _), _)| stack).collect();
        let listed: Vec<(u64, Vec<String>)> = interesting
            .into_iter()
            .map(|id| (id, self.stack_labels(&state, id)))
            .collect();
        report::write_call_stacks(&dir, &listed)?;

        if self.options.cancel.load(std::sync::atomic::Ordering::Relaxed) {
            warn!("cancellation requested, skipping call tree dump");
            return Ok(());
        }
        self.write_tree_dump(&dir, &state)?;

        info!(
            "{}: {} node(s) in the merged tree, {} leaking instruction(s)",
            self.name(),
            state.tree.nodes.len(),
            leaking.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{encode_entries, TraceFile, TracePrefix};

    fn call(source_offset: u32, destination_offset: u32) -> TraceEntry {
        TraceEntry::Branch {
            taken: true,
            kind: BranchKind::Call,
            source_image_id: 0,
            source_offset,
            destination_image_id: 0,
            destination_offset,
        }
    }

    fn jump(source_offset: u32, destination_offset: u32) -> TraceEntry {
        TraceEntry::Branch {
            taken: true,
            kind: BranchKind::Jump,
            source_image_id: 0,
            source_offset,
            destination_image_id: 0,
            destination_offset,
        }
    }

    fn ret(source_offset: u32, destination_offset: u32) -> TraceEntry {
        TraceEntry::Branch {
            taken: true,
            kind: BranchKind::Return,
            source_image_id: 0,
            source_offset,
            destination_image_id: 0,
            destination_offset,
        }
    }

    fn read(instruction_offset: u32, memory_offset: u32) -> TraceEntry {
        TraceEntry::ImageMemoryAccess {
            is_write: false,
            size: 8,
            instruction_image_id: 0,
            instruction_offset,
            memory_image_id: 0,
            memory_offset,
        }
    }

    fn analyzer() -> ControlFlowLeakageAnalyzer {
        ControlFlowLeakageAnalyzer::new(
            AnalysisOptions::new(std::env::temp_dir()),
            Arc::new(SymbolResolver::new()),
        )
    }

    fn add(analyzer: &ControlFlowLeakageAnalyzer, id: TestcaseId, entries: &[TraceEntry]) {
        let trace = TraceFile::from_bytes(encode_entries(entries), TracePrefix::empty(), id);
        analyzer.add_trace(id, &trace).unwrap();
    }

    /// Checks the set-closure invariant below every split point.
    fn verify_closure(tree: &CallTree) {
        let mut work = vec![CallTree::ROOT];
        while let Some(index) = work.pop() {
            let data = match tree.node(index).split_data() {
                Some(data) => data,
                None => continue,
            };
            if !data.split_successors.is_empty() {
                let mut union = TestcaseIdSet::new();
                for (i, &a) in data.split_successors.iter().enumerate() {
                    let set_a = &tree.split_data(a).testcases;
                    union.union_with(set_a);
                    for &b in &data.split_successors[i + 1..] {
                        for id in set_a.iter() {
                            assert!(
                                !tree.split_data(b).testcases.contains(id),
                                "testcase {} appears in two split successors",
                                id
                            );
                        }
                    }
                }
                assert_eq!(union, data.testcases, "split sets do not cover the parent");
            }
            work.extend(data.successors.iter().chain(data.split_successors.iter()));
        }
    }

    #[test]
    fn identical_traces_share_one_path() {
        let analyzer = analyzer();
        let entries = [call(0x10, 0x100), jump(0x110, 0x120), ret(0x130, 0x14)];
        add(&analyzer, 0, &entries);
        add(&analyzer, 1, &entries);

        let state = analyzer.state.lock().unwrap();
        let root = state.tree.split_data(CallTree::ROOT);
        assert_eq!(root.successors.len(), 1);
        assert!(root.split_successors.is_empty());
        let call_node = state.tree.split_data(root.successors[0]);
        assert_eq!(call_node.testcases.count(), 2);
        // Jump and return live inside the call, nothing split.
        assert_eq!(call_node.successors.len(), 2);
        assert!(call_node.split_successors.is_empty());
        verify_closure(&state.tree);

        assert!(collect_split_hashes(&state.tree).is_empty());
    }

    #[test]
    fn divergent_jumps_split_inside_the_call() {
        let analyzer = analyzer();
        add(
            &analyzer,
            0,
            &[call(0x10, 0x100), jump(0x110, 0x120), ret(0x130, 0x14)],
        );
        add(
            &analyzer,
            1,
            &[call(0x10, 0x100), jump(0x110, 0x200), ret(0x130, 0x14)],
        );

        let state = analyzer.state.lock().unwrap();
        let root = state.tree.split_data(CallTree::ROOT);
        assert_eq!(root.successors.len(), 1);
        let call_index = root.successors[0];
        assert!(matches!(state.tree.node(call_index), Node::Call { .. }));
        let call_data = state.tree.split_data(call_index);
        assert_eq!(call_data.testcases.count(), 2);
        assert!(call_data.successors.is_empty());
        assert_eq!(call_data.split_successors.len(), 2);

        let first = state.tree.split_data(call_data.split_successors[0]);
        let second = state.tree.split_data(call_data.split_successors[1]);
        assert_eq!(first.testcases.iter().collect::<Vec<_>>(), vec![0]);
        assert_eq!(second.testcases.iter().collect::<Vec<_>>(), vec![1]);
        verify_closure(&state.tree);

        // The jump source leaks with two distinct split hashes, attributed
        // to the callee's stack context.
        let hashes = collect_split_hashes(&state.tree);
        let stack = branch_stack_id(
            ROOT_STACK_ID,
            instruction_id(0, 0x10),
            instruction_id(0, 0x100),
        );
        let key = (stack, instruction_id(0, 0x110));
        assert_eq!(hashes[&key].len(), 2);
        assert_eq!(hashes.len(), 1);
    }

    #[test]
    fn third_testcase_joins_an_existing_split_side() {
        let analyzer = analyzer();
        add(&analyzer, 0, &[jump(0x10, 0x20)]);
        add(&analyzer, 1, &[jump(0x10, 0x30)]);
        add(&analyzer, 2, &[jump(0x10, 0x30)]);

        let state = analyzer.state.lock().unwrap();
        let root = state.tree.split_data(CallTree::ROOT);
        assert_eq!(root.split_successors.len(), 2);
        let second = state.tree.split_data(root.split_successors[1]);
        assert_eq!(second.testcases.iter().collect::<Vec<_>>(), vec![1, 2]);
        verify_closure(&state.tree);

        let hashes = collect_split_hashes(&state.tree);
        assert_eq!(hashes[&(ROOT_STACK_ID, instruction_id(0, 0x10))].len(), 2);
    }

    #[test]
    fn divergent_addresses_do_not_split() {
        let analyzer = analyzer();
        add(&analyzer, 0, &[read(0x50, 0x100)]);
        add(&analyzer, 1, &[read(0x50, 0x200)]);

        let state = analyzer.state.lock().unwrap();
        let root = state.tree.split_data(CallTree::ROOT);
        assert_eq!(root.successors.len(), 1);
        assert!(root.split_successors.is_empty());
        match state.tree.node(root.successors[0]) {
            Node::Memory { targets, .. } => {
                assert_eq!(targets.len(), 2);
                let sets: Vec<Vec<u32>> =
                    targets.values().map(|set| set.iter().collect()).collect();
                assert_eq!(sets, vec![vec![0], vec![1]]);
            }
            _ => panic!("expected a memory node"),
        }
        assert!(collect_split_hashes(&state.tree).is_empty());
    }

    #[test]
    fn imbalanced_return_recovers_at_root() {
        let analyzer = analyzer();
        add(&analyzer, 0, &[ret(0x10, 0), jump(0x20, 0x30)]);

        let state = analyzer.state.lock().unwrap();
        let root = state.tree.split_data(CallTree::ROOT);
        assert_eq!(root.successors.len(), 2);
        assert!(matches!(state.tree.node(root.successors[0]), Node::Return { .. }));
        assert!(matches!(state.tree.node(root.successors[1]), Node::Branch { .. }));
    }

    #[test]
    fn balanced_traces_leave_the_node_stack_empty() {
        let analyzer = analyzer();
        // Nested call/return pairs; insertion must resume correctly after
        // each return.
        let entries = [
            call(0x10, 0x100),
            call(0x110, 0x200),
            ret(0x210, 0x114),
            ret(0x120, 0x14),
            jump(0x18, 0x1C),
        ];
        add(&analyzer, 0, &entries);
        add(&analyzer, 1, &entries);

        let state = analyzer.state.lock().unwrap();
        let root = state.tree.split_data(CallTree::ROOT);
        // Outer call plus the trailing jump, both shared.
        assert_eq!(root.successors.len(), 2);
        assert!(root.split_successors.is_empty());
        verify_closure(&state.tree);
    }

    #[test]
    fn allocations_merge_by_block_id() {
        let analyzer = analyzer();
        let alloc = |address| TraceEntry::HeapAllocation {
            id: 1,
            size: 16,
            address,
        };
        add(&analyzer, 0, &[alloc(0xA000), read(0x50, 0x1)]);
        add(&analyzer, 1, &[alloc(0xB000), read(0x50, 0x1)]);

        let state = analyzer.state.lock().unwrap();
        let root = state.tree.split_data(CallTree::ROOT);
        assert_eq!(root.successors.len(), 2);
        assert!(root.split_successors.is_empty());
        assert!(matches!(
            state.tree.node(root.successors[0]),
            Node::Allocation { heap: true, block_id: 1, .. }
        ));
    }

    #[test]
    fn reports_list_leaking_jump_sources() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = AnalysisOptions::new(dir.path().to_path_buf());
        options.dump_full_data = true;
        let analyzer =
            ControlFlowLeakageAnalyzer::new(options, Arc::new(SymbolResolver::new()));
        add(
            &analyzer,
            0,
            &[call(0x10, 0x100), jump(0x110, 0x120), ret(0x130, 0x14)],
        );
        add(
            &analyzer,
            1,
            &[call(0x10, 0x100), jump(0x110, 0x200), ret(0x130, 0x14)],
        );
        analyzer.finish().unwrap();

        let out = dir.path().join("control-flow-leakage");
        let instructions = std::fs::read_to_string(out.join("instructions.txt")).unwrap();
        assert_eq!(instructions.lines().count(), 1);
        assert!(instructions.contains("image0:0x110: 2 unique hashes"));

        let stacks = std::fs::read_to_string(out.join("call-stacks.txt")).unwrap();
        assert!(stacks.contains("image0:0x10 -> image0:0x100"));

        let dump = std::fs::read_to_string(out.join("call-tree-dump.txt")).unwrap();
        assert!(dump.starts_with("@root [0 1]\n"));
        assert!(dump.contains("#call image0:0x10 -> image0:0x100"));
        assert!(dump.contains("  @split [0]"));
        assert!(dump.contains("  @split [1]"));
        assert!(dump.contains("#branch image0:0x110 -> image0:0x120"));
    }
}
