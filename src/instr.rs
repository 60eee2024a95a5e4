//! Instruction records and instruction lists.
//!
//! The decoder/encoder is `iced_x86`; this module wraps its
//! [`Instruction`] record with the translator-side state the mangler
//! needs (mangled/patchable/delay flags, a policy override for CTI
//! targets, label operands for intra-list branches) and provides the
//! doubly linked instruction list every pass operates on. Nodes live in
//! a flat arena and are linked by index, so inserts during iteration
//! never invalidate ids.

use iced_x86::{Code, Decoder, DecoderOptions, Encoder, FlowControl, Instruction, OpKind};

use crate::policy::Policy;
use crate::AppPc;

pub const INSTR_MANGLED: u8 = 1 << 0;
pub const INSTR_PATCHABLE: u8 = 1 << 1;
pub const INSTR_DELAY_BEGIN: u8 = 1 << 2;
pub const INSTR_DELAY_END: u8 = 1 << 3;

/// A label in an instruction list. Occupies no bytes; branches inside
/// generated code target labels until encoding resolves them to PCs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LabelId(pub(crate) u32);

#[derive(Debug, Clone)]
pub enum InstrBody {
    /// A machine instruction.
    Machine(Instruction),
    /// A zero-length position marker.
    Label(LabelId),
    /// Raw bytes emitted verbatim (NOP padding, jump-over-UD2 fill).
    Bytes(Vec<u8>),
}

/// One translator-side instruction record.
#[derive(Debug, Clone)]
pub struct Instr {
    pub body: InstrBody,
    pub flags: u8,
    /// Policy override for this CTI's target.
    pub policy: Option<Policy>,
    /// Intra-list branch target; resolved at encode time.
    pub target: Option<LabelId>,
    /// Source native PC; 0 for synthesized instructions.
    pub pc: AppPc,
}

impl Instr {
    pub fn decoded(machine: Instruction, pc: AppPc) -> Self {
        Instr {
            body: InstrBody::Machine(machine),
            flags: 0,
            policy: None,
            target: None,
            pc,
        }
    }

    pub fn synth(machine: Instruction) -> Self {
        Instr {
            body: InstrBody::Machine(machine),
            flags: 0,
            policy: None,
            target: None,
            pc: 0,
        }
    }

    /// A synthesized instruction the mangler must not rewrite again.
    pub fn synth_mangled(machine: Instruction) -> Self {
        let mut i = Instr::synth(machine);
        i.flags |= INSTR_MANGLED;
        i
    }

    /// A synthesized branch to a label in the same (or a sibling) list.
    pub fn synth_branch(machine: Instruction, target: LabelId) -> Self {
        let mut i = Instr::synth_mangled(machine);
        i.target = Some(target);
        i
    }

    pub fn label(id: LabelId) -> Self {
        Instr {
            body: InstrBody::Label(id),
            flags: 0,
            policy: None,
            target: None,
            pc: 0,
        }
    }

    pub fn bytes(data: Vec<u8>) -> Self {
        Instr {
            body: InstrBody::Bytes(data),
            flags: INSTR_MANGLED,
            policy: None,
            target: None,
            pc: 0,
        }
    }

    pub fn machine(&self) -> &Instruction {
        match &self.body {
            InstrBody::Machine(m) => m,
            other => panic!("not a machine instruction: {other:?}"),
        }
    }

    pub fn machine_mut(&mut self) -> &mut Instruction {
        match &mut self.body {
            InstrBody::Machine(m) => m,
            other => panic!("not a machine instruction: {other:?}"),
        }
    }

    pub fn is_machine(&self) -> bool {
        matches!(self.body, InstrBody::Machine(_))
    }

    pub fn is_label(&self) -> bool {
        matches!(self.body, InstrBody::Label(_))
    }

    pub fn label_id(&self) -> Option<LabelId> {
        match self.body {
            InstrBody::Label(id) => Some(id),
            _ => None,
        }
    }

    pub fn is_mangled(&self) -> bool {
        self.flags & INSTR_MANGLED != 0
    }

    pub fn set_mangled(&mut self) {
        self.flags |= INSTR_MANGLED;
    }

    pub fn is_patchable(&self) -> bool {
        self.flags & INSTR_PATCHABLE != 0
    }

    pub fn set_patchable(&mut self) {
        self.flags |= INSTR_PATCHABLE;
    }

    pub fn begins_delay_region(&self) -> bool {
        self.flags & INSTR_DELAY_BEGIN != 0
    }

    pub fn ends_delay_region(&self) -> bool {
        self.flags & INSTR_DELAY_END != 0
    }

    /// A control-transfer instruction: branch, call or return. Interrupt
    /// and exception-raising instructions terminate a block but are not
    /// CTIs for mangling purposes.
    pub fn is_cti(&self) -> bool {
        match &self.body {
            InstrBody::Machine(m) => matches!(
                m.flow_control(),
                FlowControl::UnconditionalBranch
                    | FlowControl::ConditionalBranch
                    | FlowControl::IndirectBranch
                    | FlowControl::Call
                    | FlowControl::IndirectCall
                    | FlowControl::Return
            ),
            _ => false,
        }
    }

    pub fn is_call(&self) -> bool {
        match &self.body {
            InstrBody::Machine(m) => matches!(
                m.flow_control(),
                FlowControl::Call | FlowControl::IndirectCall
            ),
            _ => false,
        }
    }

    pub fn is_return(&self) -> bool {
        match &self.body {
            InstrBody::Machine(m) => m.flow_control() == FlowControl::Return,
            _ => false,
        }
    }

    /// A CTI whose target is a PC encoded in the instruction.
    pub fn is_direct_cti(&self) -> bool {
        match &self.body {
            InstrBody::Machine(m) => {
                m.op_count() > 0
                    && matches!(
                        m.op0_kind(),
                        OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64
                    )
            }
            _ => false,
        }
    }

    /// Widen a short branch to its rel32 form so the encoded size no
    /// longer depends on the displacement.
    pub fn widen_if_cti(&mut self) {
        if let InstrBody::Machine(m) = &mut self.body {
            let near = m.code().as_near_branch();
            if near != m.code() {
                m.set_code(near);
            }
        }
    }
}

/// Exact encoded size of an instruction placed at `at_ip`. Label-target
/// branches are measured against a zero displacement; every intra-list
/// branch uses a fixed-width form, so the later fixup cannot change the
/// size. Unencodable instructions are fatal.
pub fn encoded_size(instr: &Instr, at_ip: u64) -> usize {
    match &instr.body {
        InstrBody::Label(_) => 0,
        InstrBody::Bytes(b) => b.len(),
        InstrBody::Machine(m) => {
            let mut probe = *m;
            if instr.target.is_some() {
                probe.set_near_branch64(at_ip);
            }
            let mut encoder = Encoder::new(64);
            encoder.encode(&probe, at_ip).unwrap_or_else(|e| {
                panic!(
                    "cannot encode instruction {:?} from {:#x}: {e}",
                    m.code(),
                    instr.pc
                )
            })
        }
    }
}

/// Encode an instruction at `at_ip` into `out`. `label_ip` supplies the
/// resolved target for label branches.
pub fn encode_into(instr: &Instr, at_ip: u64, label_ip: Option<u64>, out: &mut Vec<u8>) {
    match &instr.body {
        InstrBody::Label(_) => {}
        InstrBody::Bytes(b) => out.extend_from_slice(b),
        InstrBody::Machine(m) => {
            let mut real = *m;
            if instr.target.is_some() {
                let ip = label_ip.expect("unresolved label target");
                real.set_near_branch64(ip);
            }
            let mut encoder = Encoder::new(64);
            encoder.encode(&real, at_ip).unwrap_or_else(|e| {
                panic!(
                    "cannot encode instruction {:?} from {:#x}: {e}",
                    m.code(),
                    instr.pc
                )
            });
            out.extend_from_slice(&encoder.take_buffer());
        }
    }
}

/// Decode one instruction at a native PC. Reads at most 15 bytes, the
/// architectural maximum. An undecodable byte sequence is fatal.
pub fn decode_one(pc: AppPc) -> Instruction {
    let mut window = [0u8; 15];
    unsafe {
        std::ptr::copy_nonoverlapping(pc as *const u8, window.as_mut_ptr(), window.len());
    }
    let mut decoder = Decoder::with_ip(64, &window, pc, DecoderOptions::NONE);
    let m = decoder.decode();
    if m.code() == Code::INVALID {
        panic!("unmanageable instruction at {pc:#x}: {:?}", decoder.last_error());
    }
    m
}

/// Byte layout of one list: per-instruction offsets and the offsets
/// labels resolve to. Sizes are displacement-independent (every
/// intra-list branch uses a fixed-width form), so a layout measured at a
/// provisional base stays exact at the final one.
pub struct ListLayout {
    pub total: usize,
    offsets: Vec<(InstrId, usize)>,
    labels: std::collections::HashMap<LabelId, usize>,
}

impl ListLayout {
    /// Offsets of every label, shifted to an absolute base.
    pub fn labels_at(&self, base: u64) -> std::collections::HashMap<LabelId, u64> {
        self.labels
            .iter()
            .map(|(&l, &off)| (l, base + off as u64))
            .collect()
    }

    pub fn offset_of(&self, id: InstrId) -> Option<usize> {
        self.offsets.iter().find(|(i, _)| *i == id).map(|(_, o)| *o)
    }
}

/// Measure a list as if placed at `provisional_base`.
pub fn measure_list(ls: &InstrList, provisional_base: u64) -> ListLayout {
    let mut offsets = Vec::new();
    let mut labels = std::collections::HashMap::new();
    let mut cursor = 0usize;
    for id in ls.ids() {
        let instr = ls.get(id);
        if let Some(label) = instr.label_id() {
            labels.insert(label, cursor);
        }
        offsets.push((id, cursor));
        cursor += encoded_size(instr, provisional_base + cursor as u64);
    }
    ListLayout {
        total: cursor,
        offsets,
        labels,
    }
}

/// Encode a measured list at its final base. `labels_abs` must contain
/// every label the list branches to, including labels owned by sibling
/// lists of the same block.
pub fn encode_list(
    ls: &InstrList,
    layout: &ListLayout,
    final_base: u64,
    labels_abs: &std::collections::HashMap<LabelId, u64>,
    out: &mut Vec<u8>,
) {
    let start = out.len();
    for &(id, offset) in &layout.offsets {
        let instr = ls.get(id);
        debug_assert_eq!(out.len() - start, offset, "layout drift at {instr:?}");
        let label_ip = instr.target.map(|t| {
            *labels_abs
                .get(&t)
                .unwrap_or_else(|| panic!("branch to unplaced label {t:?}"))
        });
        encode_into(instr, final_base + offset as u64, label_ip, out);
    }
    assert_eq!(out.len() - start, layout.total, "encoded size drift");
}

const NIL: u32 = u32::MAX;

/// A stable id into an [`InstrList`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstrId(u32);

struct Node {
    instr: Instr,
    prev: u32,
    next: u32,
}

/// Doubly linked instruction list over an index arena.
pub struct InstrList {
    nodes: Vec<Node>,
    head: u32,
    tail: u32,
    next_label: u32,
}

impl InstrList {
    pub fn new() -> Self {
        InstrList {
            nodes: Vec::new(),
            head: NIL,
            tail: NIL,
            next_label: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head == NIL
    }

    pub fn len(&self) -> usize {
        let mut n = 0;
        let mut cur = self.head;
        while cur != NIL {
            n += 1;
            cur = self.nodes[cur as usize].next;
        }
        n
    }

    pub fn new_label(&mut self) -> LabelId {
        let id = LabelId(self.next_label);
        self.next_label += 1;
        id
    }

    /// Reserve label ids `0..n` for labels minted by a sibling list.
    pub fn reserve_labels(&mut self, n: u32) {
        self.next_label = self.next_label.max(n);
    }

    pub fn label_count(&self) -> u32 {
        self.next_label
    }

    fn push_node(&mut self, instr: Instr) -> u32 {
        self.nodes.push(Node {
            instr,
            prev: NIL,
            next: NIL,
        });
        (self.nodes.len() - 1) as u32
    }

    pub fn first(&self) -> Option<InstrId> {
        (self.head != NIL).then(|| InstrId(self.head))
    }

    pub fn last(&self) -> Option<InstrId> {
        (self.tail != NIL).then(|| InstrId(self.tail))
    }

    pub fn next(&self, id: InstrId) -> Option<InstrId> {
        let n = self.nodes[id.0 as usize].next;
        (n != NIL).then(|| InstrId(n))
    }

    pub fn prev(&self, id: InstrId) -> Option<InstrId> {
        let p = self.nodes[id.0 as usize].prev;
        (p != NIL).then(|| InstrId(p))
    }

    pub fn get(&self, id: InstrId) -> &Instr {
        &self.nodes[id.0 as usize].instr
    }

    pub fn get_mut(&mut self, id: InstrId) -> &mut Instr {
        &mut self.nodes[id.0 as usize].instr
    }

    pub fn append(&mut self, instr: Instr) -> InstrId {
        let idx = self.push_node(instr);
        let node = &mut self.nodes[idx as usize];
        node.prev = self.tail;
        if self.tail != NIL {
            self.nodes[self.tail as usize].next = idx;
        } else {
            self.head = idx;
        }
        self.tail = idx;
        InstrId(idx)
    }

    pub fn prepend(&mut self, instr: Instr) -> InstrId {
        let idx = self.push_node(instr);
        let node = &mut self.nodes[idx as usize];
        node.next = self.head;
        if self.head != NIL {
            self.nodes[self.head as usize].prev = idx;
        } else {
            self.tail = idx;
        }
        self.head = idx;
        InstrId(idx)
    }

    pub fn insert_before(&mut self, at: InstrId, instr: Instr) -> InstrId {
        let prev = self.nodes[at.0 as usize].prev;
        if prev == NIL {
            return self.prepend(instr);
        }
        let idx = self.push_node(instr);
        self.nodes[idx as usize].prev = prev;
        self.nodes[idx as usize].next = at.0;
        self.nodes[prev as usize].next = idx;
        self.nodes[at.0 as usize].prev = idx;
        InstrId(idx)
    }

    pub fn insert_after(&mut self, at: InstrId, instr: Instr) -> InstrId {
        let next = self.nodes[at.0 as usize].next;
        if next == NIL {
            return self.append(instr);
        }
        let idx = self.push_node(instr);
        self.nodes[idx as usize].prev = at.0;
        self.nodes[idx as usize].next = next;
        self.nodes[at.0 as usize].next = idx;
        self.nodes[next as usize].prev = idx;
        InstrId(idx)
    }

    /// Unlink an instruction. The id stays valid but the node no longer
    /// participates in iteration or encoding.
    pub fn remove(&mut self, id: InstrId) {
        let (prev, next) = {
            let n = &self.nodes[id.0 as usize];
            (n.prev, n.next)
        };
        if prev != NIL {
            self.nodes[prev as usize].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.nodes[next as usize].prev = prev;
        } else {
            self.tail = prev;
        }
        let n = &mut self.nodes[id.0 as usize];
        n.prev = NIL;
        n.next = NIL;
    }

    /// Append a fresh label and return (list id, label id).
    pub fn append_label(&mut self) -> (InstrId, LabelId) {
        let label = self.new_label();
        (self.append(Instr::label(label)), label)
    }

    /// Ids in list order, collected up front so the caller may mutate
    /// while walking.
    pub fn ids(&self) -> Vec<InstrId> {
        let mut out = Vec::new();
        let mut cur = self.head;
        while cur != NIL {
            out.push(InstrId(cur));
            cur = self.nodes[cur as usize].next;
        }
        out
    }
}

impl Default for InstrList {
    fn default() -> Self {
        Self::new()
    }
}
