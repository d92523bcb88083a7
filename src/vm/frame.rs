//! Activation records and the block-based frame stack.
//!
//! A frame is one contiguous allocation:
//!
//! ```text
//! header | params (VmValue x max_param) | floats | strings | pointers | ints | extra
//! ```
//!
//! Offsets come from [`frame_layout`] alone, so allocation, the interpreter
//! and JIT-generated code agree on them by construction.

use std::alloc::{self, Layout};
use std::mem::size_of;
use std::ptr::{self, NonNull};

use tracing::trace;

use super::abort::Abort;
use super::function::{Function, SpecialInit};
use super::opcodes::{REGT_FLOAT, REGT_INT, REGT_POINTER, REGT_STRING};
use super::value::VmValue;

pub const FRAME_ALIGN: usize = 16;
pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;
const MAX_BLOCK_SIZE: usize = 1 << 30;

/// Register-bank sizes of one function.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct RegCounts {
    pub int: u16,
    pub float: u16,
    pub string: u16,
    pub pointer: u16,
    pub max_param: u16,
    pub extra_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    pub param_offset: usize,
    pub float_offset: usize,
    pub string_offset: usize,
    pub pointer_offset: usize,
    pub int_offset: usize,
    pub extra_offset: usize,
    pub size: usize,
}

const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

pub const fn frame_layout(counts: RegCounts) -> FrameLayout {
    let param_offset = align_up(size_of::<FrameHeader>(), FRAME_ALIGN);
    let float_offset = param_offset + counts.max_param as usize * size_of::<VmValue<'static>>();
    let string_offset = float_offset + counts.float as usize * size_of::<f64>();
    let pointer_offset = string_offset + counts.string as usize * size_of::<String>();
    let int_offset = pointer_offset + counts.pointer as usize * size_of::<*mut u8>();
    let extra_offset = align_up(int_offset + counts.int as usize * size_of::<i32>(), FRAME_ALIGN);
    FrameLayout {
        param_offset,
        float_offset,
        string_offset,
        pointer_offset,
        int_offset,
        extra_offset,
        size: align_up(extra_offset + counts.extra_size as usize, FRAME_ALIGN),
    }
}

#[repr(C)]
#[derive(Debug)]
pub struct FrameHeader {
    pub parent: *mut FrameHeader,
    pub func: *const Function,
    pub num_int: u16,
    pub num_float: u16,
    pub num_string: u16,
    pub num_pointer: u16,
    pub num_param: u16,
    pub max_param: u16,
    /// Last pc recorded before a call, for frame walks.
    pub pc: u32,
}

#[cfg(target_pointer_width = "64")]
const _: () = assert!(size_of::<FrameHeader>() == 32);

impl FrameHeader {
    pub fn counts(&self) -> RegCounts {
        RegCounts {
            int: self.num_int,
            float: self.num_float,
            string: self.num_string,
            pointer: self.num_pointer,
            max_param: self.max_param,
            extra_size: 0,
        }
    }
}

/// Handle to a live frame. Consumed by [`FrameStack::pop_frame`].
#[derive(Debug)]
pub struct Frame {
    ptr: NonNull<FrameHeader>,
    layout: FrameLayout,
}

/// Typed views over one frame's banks.
pub(crate) struct Registers<'f> {
    pub d: &'f mut [i32],
    pub f: &'f mut [f64],
    pub s: &'f mut [String],
    pub a: &'f mut [*mut u8],
    pub params: &'f mut [VmValue<'static>],
    pub extra: *mut u8,
}

impl Frame {
    pub fn as_ptr(&self) -> *mut FrameHeader {
        self.ptr.as_ptr()
    }

    pub fn layout(&self) -> FrameLayout {
        self.layout
    }

    fn base(&self) -> *mut u8 {
        self.ptr.as_ptr() as *mut u8
    }

    pub fn header(&self) -> &FrameHeader {
        // SAFETY: the frame is live until `pop_frame` consumes this handle.
        unsafe { self.ptr.as_ref() }
    }

    pub fn set_pc(&mut self, pc: usize) {
        // SAFETY: as above; the header is only written through this handle.
        unsafe { self.ptr.as_mut().pc = pc as u32 };
    }

    pub fn set_num_param(&mut self, n: u16) {
        // SAFETY: as above.
        unsafe { self.ptr.as_mut().num_param = n };
    }

    pub fn extra(&self) -> *mut u8 {
        // SAFETY: extra_offset lies within the allocation.
        unsafe { self.base().add(self.layout.extra_offset) }
    }

    /// # Safety
    /// The returned slices alias frame memory; they must not outlive the
    /// frame and no other view may be created while they are in use.
    pub(crate) unsafe fn registers<'f>(&self) -> Registers<'f> {
        let h = self.header();
        let base = self.base();
        let l = self.layout;
        // SAFETY: each bank was initialized by `construct` at the offsets
        // `frame_layout` returned for these counts; banks do not overlap.
        unsafe {
            Registers {
                d: std::slice::from_raw_parts_mut(base.add(l.int_offset) as *mut i32, h.num_int as usize),
                f: std::slice::from_raw_parts_mut(base.add(l.float_offset) as *mut f64, h.num_float as usize),
                s: std::slice::from_raw_parts_mut(base.add(l.string_offset) as *mut String, h.num_string as usize),
                a: std::slice::from_raw_parts_mut(base.add(l.pointer_offset) as *mut *mut u8, h.num_pointer as usize),
                params: std::slice::from_raw_parts_mut(
                    base.add(l.param_offset) as *mut VmValue<'static>,
                    h.max_param as usize,
                ),
                extra: base.add(l.extra_offset),
            }
        }
    }
}

impl Registers<'_> {
    /// Copy incoming parameters into the banks in order.
    pub fn load_params(&mut self, params: &[VmValue]) -> Result<(), Abort> {
        let (mut di, mut fi, mut si, mut ai) = (0, 0, 0, 0);
        for p in params {
            let ok = match p.tag() {
                REGT_INT => self.d.get_mut(di).map(|r| {
                    *r = p.bits() as u32 as i32;
                    di += 1;
                }),
                REGT_FLOAT => self.f.get_mut(fi).map(|r| {
                    *r = f64::from_bits(p.bits());
                    fi += 1;
                }),
                REGT_STRING => self.s.get_mut(si).map(|r| {
                    r.clear();
                    r.push_str(p.as_str().unwrap_or_default());
                    si += 1;
                }),
                REGT_POINTER => self.a.get_mut(ai).map(|r| {
                    *r = p.bits() as usize as *mut u8;
                    ai += 1;
                }),
                _ => None,
            };
            if ok.is_none() {
                return Err(Abort::other("too many arguments"));
            }
        }
        Ok(())
    }
}

/// Zero a fresh frame and construct its strings and special values.
///
/// # Safety
/// `base` must point to `layout.size` writable bytes aligned to FRAME_ALIGN.
pub(crate) unsafe fn construct(base: *mut u8, layout: &FrameLayout, counts: &RegCounts, specials: &[SpecialInit]) {
    unsafe {
        ptr::write_bytes(base, 0, layout.size);
        let strings = base.add(layout.string_offset) as *mut String;
        for i in 0..counts.string as usize {
            ptr::write(strings.add(i), String::new());
        }
        for special in specials {
            let p = base.add(layout.extra_offset + special.offset as usize) as *mut String;
            for i in 0..special.count() {
                ptr::write(p.add(i), String::new());
            }
        }
    }
}

/// Drop what `construct` built.
///
/// # Safety
/// The frame must have been built by `construct` with the same arguments.
pub(crate) unsafe fn destruct(base: *mut u8, layout: &FrameLayout, counts: &RegCounts, specials: &[SpecialInit]) {
    unsafe {
        let strings = base.add(layout.string_offset) as *mut String;
        ptr::drop_in_place(ptr::slice_from_raw_parts_mut(strings, counts.string as usize));
        for special in specials {
            let p = base.add(layout.extra_offset + special.offset as usize) as *mut String;
            ptr::drop_in_place(ptr::slice_from_raw_parts_mut(p, special.count()));
        }
    }
}

struct Block {
    base: NonNull<u8>,
    size: usize,
    used: usize,
    last_frame: *mut FrameHeader,
}

impl Block {
    fn new(size: usize) -> Block {
        // SAFETY: FRAME_ALIGN is a power of two and size is clamped far
        // below isize::MAX.
        let layout = unsafe { Layout::from_size_align_unchecked(size, FRAME_ALIGN) };
        // SAFETY: size is non-zero.
        let raw = unsafe { alloc::alloc(layout) };
        let base = NonNull::new(raw).unwrap_or_else(|| alloc::handle_alloc_error(layout));
        Block { base, size, used: 0, last_frame: ptr::null_mut() }
    }

    fn contains(&self, p: *const FrameHeader) -> bool {
        let start = self.base.as_ptr() as usize;
        let p = p as usize;
        p >= start && p < start + self.size
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        // SAFETY: allocated in `Block::new` with this exact layout.
        unsafe {
            alloc::dealloc(self.base.as_ptr(), Layout::from_size_align_unchecked(self.size, FRAME_ALIGN));
        }
    }
}

/// Where the allocator stands; equal snapshots mean identical state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackSnapshot {
    /// (block base address, bytes used) per block in use.
    pub blocks: Vec<(usize, usize)>,
    pub depth: usize,
    pub top: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameInfo {
    pub function: String,
    pub pc: usize,
    pub line: Option<u32>,
}

/// LIFO arena of frames. One per execution thread; neither `Send` nor `Sync`.
///
/// Functions must outlive the frames allocated for them.
pub struct FrameStack {
    blocks: Vec<Block>,
    spare: Option<Block>,
    block_size: usize,
    top: *mut FrameHeader,
    depth: usize,
}

impl FrameStack {
    pub fn new() -> Self {
        Self::with_block_size(DEFAULT_BLOCK_SIZE)
    }

    pub fn with_block_size(block_size: usize) -> Self {
        let block_size = align_up(block_size.clamp(FRAME_ALIGN, MAX_BLOCK_SIZE), FRAME_ALIGN);
        FrameStack {
            blocks: vec![Block::new(block_size)],
            spare: None,
            block_size,
            top: ptr::null_mut(),
            depth: 0,
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn top(&self) -> Option<&FrameHeader> {
        // SAFETY: `top` is null or a live frame header.
        unsafe { self.top.as_ref() }
    }

    fn block_for(&mut self, size: usize) -> &mut Block {
        let fits = self.blocks.last().is_some_and(|b| b.size - b.used >= size);
        if !fits {
            let block = match self.spare.take() {
                Some(spare) if spare.size >= size => spare,
                _ => Block::new(self.block_size.max(align_up(size, FRAME_ALIGN))),
            };
            trace!(size = block.size, blocks = self.blocks.len() + 1, "frame stack grew");
            self.blocks.push(block);
        }
        let last = self.blocks.len() - 1;
        &mut self.blocks[last]
    }

    /// Allocate and construct a frame for `func`.
    pub fn alloc_frame(&mut self, func: &Function) -> Frame {
        let (counts, specials) = match func.body() {
            Some(body) => (body.counts, body.special_inits.as_slice()),
            None => (RegCounts::default(), &[][..]),
        };
        let layout = frame_layout(counts);
        let parent = self.top;
        let block = self.block_for(layout.size);
        // SAFETY: `block_for` guarantees `layout.size` free bytes past `used`;
        // `used` stays a multiple of FRAME_ALIGN.
        let base = unsafe { block.base.as_ptr().add(block.used) };
        block.used += layout.size;
        block.last_frame = base as *mut FrameHeader;
        // SAFETY: fresh, exclusively owned memory of the right size.
        unsafe {
            construct(base, &layout, &counts, specials);
            ptr::write(
                base as *mut FrameHeader,
                FrameHeader {
                    parent,
                    func: func as *const Function,
                    num_int: counts.int,
                    num_float: counts.float,
                    num_string: counts.string,
                    num_pointer: counts.pointer,
                    num_param: 0,
                    max_param: counts.max_param,
                    pc: 0,
                },
            );
        }
        self.top = base as *mut FrameHeader;
        self.depth += 1;
        // SAFETY: `base` points into a live block.
        Frame { ptr: unsafe { NonNull::new_unchecked(self.top) }, layout }
    }

    /// Pop `frame`, which must be the top of the stack.
    pub fn pop_frame(&mut self, frame: Frame) {
        debug_assert_eq!(frame.as_ptr(), self.top, "frames must be popped in LIFO order");
        self.pop_top();
    }

    pub(crate) fn pop_top(&mut self) {
        let header = self.top;
        if header.is_null() {
            return;
        }
        // SAFETY: `header` is the live top frame; its function outlives it.
        let (parent, func) = unsafe { ((*header).parent, (*header).func) };
        let (counts, specials) = match unsafe { func.as_ref() }.and_then(Function::body) {
            Some(body) => (body.counts, body.special_inits.as_slice()),
            None => (RegCounts::default(), &[][..]),
        };
        let layout = frame_layout(counts);
        // SAFETY: built by `alloc_frame` with these counts.
        unsafe { destruct(header as *mut u8, &layout, &counts, specials) };

        let last = self.blocks.len() - 1;
        let block = &mut self.blocks[last];
        debug_assert!(block.contains(header));
        block.used = header as usize - block.base.as_ptr() as usize;
        block.last_frame = if block.contains(parent) { parent } else { ptr::null_mut() };
        let emptied = block.used == 0 && last > 0;
        self.top = parent;
        self.depth -= 1;
        if emptied {
            self.spare = self.blocks.pop();
        }
    }

    pub fn snapshot(&self) -> StackSnapshot {
        StackSnapshot {
            blocks: self.blocks.iter().map(|b| (b.base.as_ptr() as usize, b.used)).collect(),
            depth: self.depth,
            top: self.top as usize,
        }
    }

    /// Walk live frames, innermost first.
    ///
    /// Only frames allocated on this stack are listed. Compiled functions
    /// that keep their registers in a native stack slot never appear, and
    /// compiled functions with a full frame report pc 0 and the line of
    /// their first instruction. Abort stack traces are built separately and
    /// cover every engine.
    pub fn frames(&self) -> Vec<FrameInfo> {
        let mut out = Vec::with_capacity(self.depth);
        let mut cur = self.top;
        // SAFETY: the parent chain only links live frames.
        while let Some(h) = unsafe { cur.as_ref() } {
            let func = unsafe { h.func.as_ref() };
            out.push(FrameInfo {
                function: func.map_or_else(String::new, |f| f.name.clone()),
                pc: h.pc as usize,
                line: func.and_then(Function::body).and_then(|b| b.pc_to_line(h.pc as usize)),
            });
            cur = h.parent;
        }
        out
    }
}

impl Default for FrameStack {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FrameStack {
    fn drop(&mut self) {
        while !self.top.is_null() {
            self.pop_top();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::function::{FunctionFlags, Proto, ScriptFunction, SpecialKind};
    use crate::vm::opcodes::*;

    fn func(counts: RegCounts) -> Function {
        let f = Function::script("f", FunctionFlags::STATIC, Proto::default());
        let body = ScriptFunction::new(vec![Op::abc(OP_RET, RET_FINAL, REGT_NIL, 0)], counts);
        f.define(body).unwrap();
        f
    }

    #[test]
    fn layout_orders_banks_after_params() {
        let l = frame_layout(RegCounts { int: 3, float: 2, string: 1, pointer: 1, max_param: 2, extra_size: 5 });
        assert_eq!(l.param_offset, 32);
        assert_eq!(l.float_offset, 32 + 2 * 16);
        assert_eq!(l.string_offset, l.float_offset + 16);
        assert_eq!(l.pointer_offset, l.string_offset + size_of::<String>());
        assert_eq!(l.int_offset, l.pointer_offset + 8);
        assert_eq!(l.extra_offset % FRAME_ALIGN, 0);
        assert!(l.extra_offset >= l.int_offset + 12);
        assert_eq!(l.size % FRAME_ALIGN, 0);
        assert!(l.size >= l.extra_offset + 5);
    }

    #[test]
    fn empty_function_has_header_only() {
        assert_eq!(frame_layout(RegCounts::default()).size, 32);
    }

    #[test]
    fn alloc_then_pop_restores_state() {
        let small = func(RegCounts { int: 4, float: 1, ..Default::default() });
        let big = func(RegCounts { int: 200, string: 20, max_param: 40, ..Default::default() });
        let mut stack = FrameStack::with_block_size(1024);
        let outer = stack.alloc_frame(&small);
        for _ in 0..50 {
            let before = stack.snapshot();
            let a = stack.alloc_frame(&big);
            let b = stack.alloc_frame(&small);
            stack.pop_frame(b);
            stack.pop_frame(a);
            assert_eq!(stack.snapshot(), before);
        }
        stack.pop_frame(outer);
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn oversized_frame_gets_its_own_block() {
        let big = func(RegCounts { int: 4000, ..Default::default() });
        let mut stack = FrameStack::with_block_size(256);
        let before = stack.snapshot();
        let f = stack.alloc_frame(&big);
        assert_eq!(stack.snapshot().blocks.len(), 2);
        stack.pop_frame(f);
        assert_eq!(stack.snapshot(), before);
    }

    #[test]
    fn frames_link_to_parents() {
        let f = func(RegCounts { int: 1, ..Default::default() });
        let mut stack = FrameStack::new();
        let a = stack.alloc_frame(&f);
        let b = stack.alloc_frame(&f);
        assert_eq!(b.header().parent, a.as_ptr());
        assert_eq!(stack.frames().len(), 2);
        stack.pop_frame(b);
        assert_eq!(stack.top().map(|h| h as *const FrameHeader), Some(a.as_ptr() as *const _));
        stack.pop_frame(a);
        assert!(stack.top().is_none());
    }

    #[test]
    fn strings_and_specials_are_constructed() {
        let f = Function::script("s", FunctionFlags::STATIC, Proto::default());
        let mut body = ScriptFunction::new(
            vec![Op::abc(OP_RET, RET_FINAL, REGT_NIL, 0)],
            RegCounts { string: 2, extra_size: 2 * size_of::<String>() as u32, ..Default::default() },
        );
        body.special_inits = vec![SpecialInit { kind: SpecialKind::StringArray(2), offset: 0 }];
        f.define(body).unwrap();
        let mut stack = FrameStack::new();
        let frame = stack.alloc_frame(&f);
        let regs = unsafe { frame.registers() };
        regs.s[1].push_str("grown");
        let special = unsafe { &mut *(frame.extra() as *mut String).add(1) };
        special.push_str("also");
        stack.pop_frame(frame);
    }

    #[test]
    fn params_fill_banks_in_order() {
        let f = func(RegCounts { int: 2, float: 1, string: 1, ..Default::default() });
        let mut stack = FrameStack::new();
        let frame = stack.alloc_frame(&f);
        let mut regs = unsafe { frame.registers() };
        let s = String::from("x");
        regs.load_params(&[VmValue::int(1), VmValue::float(2.0), VmValue::string(&s), VmValue::int(3)]).unwrap();
        assert_eq!(regs.d, &[1, 3]);
        assert_eq!(regs.f, &[2.0]);
        assert_eq!(regs.s[0], "x");
        assert!(regs.load_params(&[VmValue::pointer(ptr::null_mut())]).is_err());
        stack.pop_frame(frame);
    }
}
