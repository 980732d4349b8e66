//! Shared builders for the end-to-end test programs and an execution
//! harness around the interpreter.

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use aspis_interp::{ExecError, Machine, Val};
use aspis_ir::{
    Builder, Callee, FnAttrs, FuncId, Function, GlobalVar, InstId, IntPred, Linkage,
    MemoryEffects, Module, Param, ParamAttrs, RetAttrs, TypeId, Value,
};
use aspisc::annotations::add_annotation;

pub fn new_func(m: &mut Module, name: &str, ret: TypeId, params: &[(&str, TypeId)]) -> FuncId {
    m.add_function(Function {
        name: name.into(),
        dbg_name: None,
        ret_ty: ret,
        params: params
            .iter()
            .map(|(n, t)| Param {
                name: (*n).to_string(),
                ty: *t,
                attrs: ParamAttrs::default(),
            })
            .collect(),
        vararg: false,
        linkage: Linkage::External,
        attrs: FnAttrs::default(),
        ret_attrs: RetAttrs::default(),
        mem_effects: MemoryEffects::Unknown,
        blocks: vec![],
    })
}

pub fn name(m: &mut Module, inst: InstId, n: &str) -> Value {
    m.inst_mut(inst).name = Some(n.to_string());
    Value::Inst(inst)
}

fn i32c(m: &mut Module, v: i64) -> Value {
    Value::Const(m.const_i32(v))
}

/// `fact(5)` printed from `main`; expected output `120`.
pub fn fact_module() -> Module {
    let mut m = Module::new("fact");
    let i32t = m.tys.i32;
    let void = m.tys.void;
    let print = new_func(&mut m, "print", void, &[("v", i32t)]);
    let fact = new_func(&mut m, "fact", i32t, &[("n", i32t)]);

    let entry = m.new_block(fact, "entry");
    let base = m.new_block(fact, "base");
    let rec = m.new_block(fact, "rec");
    let n = Value::Arg(fact, 0);
    let one = i32c(&mut m, 1);
    let mut b = Builder::at_end(&mut m, entry);
    let cmp = b.icmp(IntPred::Sle, n, one);
    b.cond_br(Value::Inst(cmp), base, rec);
    name(&mut m, cmp, "cmp");
    Builder::at_end(&mut m, base).ret(one);
    let mut b = Builder::at_end(&mut m, rec);
    let n1 = b.sub(i32t, n, one);
    let r = b.call(Callee::Direct(fact), i32t, vec![Value::Inst(n1)]);
    let p = b.bin(aspis_ir::BinOp::Mul, i32t, n, Value::Inst(r));
    b.ret(Value::Inst(p));
    name(&mut m, n1, "n1");
    name(&mut m, r, "r");
    name(&mut m, p, "p");

    let main = new_func(&mut m, "main", i32t, &[]);
    let entry = m.new_block(main, "entry");
    let five = i32c(&mut m, 5);
    let zero = i32c(&mut m, 0);
    let mut b = Builder::at_end(&mut m, entry);
    let res = b.call(Callee::Direct(fact), i32t, vec![five]);
    b.call(Callee::Direct(print), void, vec![Value::Inst(res)]);
    b.ret(zero);
    name(&mut m, res, "res");
    m
}

/// XOR-cipher round trip over `"HELLOWORLD"` with a duplicated key global
/// and a `to_duplicate` process routine; prints `1` on success.
pub fn xor_module() -> Module {
    let mut m = Module::new("xor");
    let i32t = m.tys.i32;
    let i8t = m.tys.i8;
    let i64t = m.tys.i64;
    let void = m.tys.void;
    let ptr = m.tys.ptr;

    let msg_init = m.const_bytes(b"HELLOWORLD".to_vec());
    let msg_ty = m.const_type(msg_init);
    let mut msg_gv = GlobalVar::new("msg", msg_ty);
    msg_gv.is_const = true;
    msg_gv.init = Some(msg_init);
    let msg = m.add_global(msg_gv);

    let key_init = m.const_i32(0x5A);
    let mut key_gv = GlobalVar::new("key", i32t);
    key_gv.init = Some(key_init);
    let key = m.add_global(key_gv);
    add_annotation(&mut m, Value::Global(key), "to_duplicate");

    let print = new_func(&mut m, "print", void, &[("v", i32t)]);
    let memcpy = new_func(
        &mut m,
        "llvm.memcpy.p0.p0.i64",
        void,
        &[("dst", ptr), ("src", ptr), ("len", i64t)],
    );

    // process(buf, len): buf[i] ^= key for i in 0..len
    let process = new_func(&mut m, "process", void, &[("buf", ptr), ("len", i32t)]);
    add_annotation(&mut m, Value::Func(process), "to_duplicate");
    {
        let entry = m.new_block(process, "entry");
        let cond = m.new_block(process, "cond");
        let body = m.new_block(process, "body");
        let incr = m.new_block(process, "incr");
        let exit = m.new_block(process, "exit");
        let buf = Value::Arg(process, 0);
        let len = Value::Arg(process, 1);
        let zero = i32c(&mut m, 0);
        let one = i32c(&mut m, 1);
        let key_v = Value::Global(key);

        let mut b = Builder::at_end(&mut m, entry);
        let i_slot = b.alloca(i32t);
        b.store(zero, Value::Inst(i_slot));
        b.br(cond);
        name(&mut m, i_slot, "i_slot");

        let mut b = Builder::at_end(&mut m, cond);
        let i = b.load(i32t, Value::Inst(i_slot));
        let c = b.icmp(IntPred::Slt, Value::Inst(i), len);
        b.cond_br(Value::Inst(c), body, exit);
        name(&mut m, i, "i");

        let mut b = Builder::at_end(&mut m, body);
        let p = b.gep(i8t, buf, vec![Value::Inst(i)]);
        let ch = b.load(i8t, Value::Inst(p));
        let k = b.load(i32t, key_v);
        let k8 = b.cast(aspis_ir::CastOp::Trunc, i8t, Value::Inst(k));
        let x = b.bin(aspis_ir::BinOp::Xor, i8t, Value::Inst(ch), Value::Inst(k8));
        b.store(Value::Inst(x), Value::Inst(p));
        b.br(incr);
        name(&mut m, ch, "ch");
        name(&mut m, k, "k");
        name(&mut m, x, "x");

        let mut b = Builder::at_end(&mut m, incr);
        let i2 = b.add(i32t, Value::Inst(i), one);
        b.store(Value::Inst(i2), Value::Inst(i_slot));
        b.br(cond);

        Builder::at_end(&mut m, exit).ret_void();
    }

    // main: copy, encrypt, decrypt, compare
    let main = new_func(&mut m, "main", i32t, &[]);
    {
        let entry = m.new_block(main, "entry");
        let ccond = m.new_block(main, "ccond");
        let cbody = m.new_block(main, "cbody");
        let cfail = m.new_block(main, "cfail");
        let cnext = m.new_block(main, "cnext");
        let cdone = m.new_block(main, "cdone");
        let zero = i32c(&mut m, 0);
        let one = i32c(&mut m, 1);
        let ten = i32c(&mut m, 10);
        let ten64 = Value::Const(m.const_int(i64t, 10));
        let arr10 = m.array_type(i8t, 10);

        let mut b = Builder::at_end(&mut m, entry);
        let buf = b.alloca(arr10);
        b.call(
            Callee::Direct(memcpy),
            void,
            vec![Value::Inst(buf), Value::Global(msg), ten64],
        );
        b.call(Callee::Direct(process), void, vec![Value::Inst(buf), ten]);
        b.call(Callee::Direct(process), void, vec![Value::Inst(buf), ten]);
        let ok_slot = b.alloca(i32t);
        b.store(one, Value::Inst(ok_slot));
        let j_slot = b.alloca(i32t);
        b.store(zero, Value::Inst(j_slot));
        b.br(ccond);
        name(&mut m, buf, "buf");
        name(&mut m, ok_slot, "ok_slot");
        name(&mut m, j_slot, "j_slot");

        let mut b = Builder::at_end(&mut m, ccond);
        let j = b.load(i32t, Value::Inst(j_slot));
        let c = b.icmp(IntPred::Slt, Value::Inst(j), ten);
        b.cond_br(Value::Inst(c), cbody, cdone);
        name(&mut m, j, "j");

        let mut b = Builder::at_end(&mut m, cbody);
        let p1 = b.gep(i8t, Value::Inst(buf), vec![Value::Inst(j)]);
        let a = b.load(i8t, Value::Inst(p1));
        let p2 = b.gep(i8t, Value::Global(msg), vec![Value::Inst(j)]);
        let e = b.load(i8t, Value::Inst(p2));
        let eq = b.icmp(IntPred::Eq, Value::Inst(a), Value::Inst(e));
        b.cond_br(Value::Inst(eq), cnext, cfail);

        let mut b = Builder::at_end(&mut m, cfail);
        b.store(zero, Value::Inst(ok_slot));
        b.br(cnext);

        let mut b = Builder::at_end(&mut m, cnext);
        let j1 = b.add(i32t, Value::Inst(j), one);
        b.store(Value::Inst(j1), Value::Inst(j_slot));
        b.br(ccond);

        let mut b = Builder::at_end(&mut m, cdone);
        let ok = b.load(i32t, Value::Inst(ok_slot));
        b.call(Callee::Direct(print), void, vec![Value::Inst(ok)]);
        b.ret(zero);
        name(&mut m, ok, "ok");
    }
    m
}

/// `fptr = foo; print(fptr())` where `foo() == 42`.
pub fn fptr_module() -> Module {
    let mut m = Module::new("fptr");
    let i32t = m.tys.i32;
    let void = m.tys.void;
    let ptr = m.tys.ptr;
    let print = new_func(&mut m, "print", void, &[("v", i32t)]);

    let foo = new_func(&mut m, "foo", i32t, &[]);
    let bb = m.new_block(foo, "entry");
    let forty_two = i32c(&mut m, 42);
    Builder::at_end(&mut m, bb).ret(forty_two);

    let main = new_func(&mut m, "main", i32t, &[]);
    let entry = m.new_block(main, "entry");
    let zero = i32c(&mut m, 0);
    let mut b = Builder::at_end(&mut m, entry);
    let slot = b.alloca(ptr);
    b.store(Value::Func(foo), Value::Inst(slot));
    let fp = b.load(ptr, Value::Inst(slot));
    let r = b.call(Callee::Indirect(Value::Inst(fp)), i32t, vec![]);
    b.call(Callee::Direct(print), void, vec![Value::Inst(r)]);
    b.ret(zero);
    name(&mut m, slot, "fptr_slot");
    name(&mut m, fp, "fp");
    name(&mut m, r, "r");
    m
}

/// Loop with `continue` at `i == 1` and `break` at `i == 3`; prints `2`.
pub fn loop_module() -> Module {
    let mut m = Module::new("loop");
    let i32t = m.tys.i32;
    let void = m.tys.void;
    let print = new_func(&mut m, "print", void, &[("v", i32t)]);

    let main = new_func(&mut m, "main", i32t, &[]);
    let entry = m.new_block(main, "entry");
    let cond = m.new_block(main, "cond");
    let body = m.new_block(main, "body");
    let chk3 = m.new_block(main, "chk3");
    let addres = m.new_block(main, "addres");
    let cont = m.new_block(main, "cont");
    let exit = m.new_block(main, "exit");

    let zero = i32c(&mut m, 0);
    let one = i32c(&mut m, 1);
    let three = i32c(&mut m, 3);
    let five = i32c(&mut m, 5);

    let mut b = Builder::at_end(&mut m, entry);
    let res = b.alloca(i32t);
    b.store(zero, Value::Inst(res));
    let i_slot = b.alloca(i32t);
    b.store(zero, Value::Inst(i_slot));
    b.br(cond);
    name(&mut m, res, "res");
    name(&mut m, i_slot, "i_slot");

    let mut b = Builder::at_end(&mut m, cond);
    let i = b.load(i32t, Value::Inst(i_slot));
    let c = b.icmp(IntPred::Slt, Value::Inst(i), five);
    b.cond_br(Value::Inst(c), body, exit);
    name(&mut m, i, "i");

    let mut b = Builder::at_end(&mut m, body);
    let is_one = b.icmp(IntPred::Eq, Value::Inst(i), one);
    b.cond_br(Value::Inst(is_one), cont, chk3);
    name(&mut m, is_one, "is_one");

    let mut b = Builder::at_end(&mut m, chk3);
    let is_three = b.icmp(IntPred::Eq, Value::Inst(i), three);
    b.cond_br(Value::Inst(is_three), exit, addres);
    name(&mut m, is_three, "is_three");

    let mut b = Builder::at_end(&mut m, addres);
    let r = b.load(i32t, Value::Inst(res));
    let r2 = b.add(i32t, Value::Inst(r), Value::Inst(i));
    b.store(Value::Inst(r2), Value::Inst(res));
    b.br(cont);
    name(&mut m, r2, "r2");

    let mut b = Builder::at_end(&mut m, cont);
    let i2 = b.add(i32t, Value::Inst(i), one);
    b.store(Value::Inst(i2), Value::Inst(i_slot));
    b.br(cond);

    let mut b = Builder::at_end(&mut m, exit);
    let fin = b.load(i32t, Value::Inst(res));
    b.call(Callee::Direct(print), void, vec![Value::Inst(fin)]);
    b.ret(zero);
    name(&mut m, fin, "final");
    m
}

/// `switch(3)` over `{0->100, 1->200, 2->250, 3->300, 4->400}`; prints `300`.
pub fn switch_module() -> Module {
    let mut m = Module::new("switch");
    let i32t = m.tys.i32;
    let void = m.tys.void;
    let print = new_func(&mut m, "print", void, &[("v", i32t)]);

    let main = new_func(&mut m, "main", i32t, &[]);
    let entry = m.new_block(main, "entry");
    let done = m.new_block(main, "done");
    let dflt = m.new_block(main, "default");
    let values = [100i64, 200, 250, 300, 400];
    let cases: Vec<aspis_ir::BlockId> = (0..5)
        .map(|i| m.new_block(main, format!("case{i}")))
        .collect();

    let zero = i32c(&mut m, 0);
    let three = i32c(&mut m, 3);
    let mut b = Builder::at_end(&mut m, entry);
    let slot = b.alloca(i32t);
    b.store(zero, Value::Inst(slot));
    b.switch(
        three,
        dflt,
        cases.iter().enumerate().map(|(i, b)| (i as u64, *b)).collect(),
    );
    name(&mut m, slot, "slot");

    for (i, case) in cases.iter().enumerate() {
        let v = i32c(&mut m, values[i]);
        let mut b = Builder::at_end(&mut m, *case);
        b.store(v, Value::Inst(slot));
        b.br(done);
    }
    let mut b = Builder::at_end(&mut m, dflt);
    b.store(zero, Value::Inst(slot));
    b.br(done);

    let mut b = Builder::at_end(&mut m, done);
    let r = b.load(i32t, Value::Inst(slot));
    b.call(Callee::Direct(print), void, vec![Value::Inst(r)]);
    b.ret(zero);
    name(&mut m, r, "picked");
    m
}

/// Global counter incremented twice by one function and printed by
/// another; prints `2`. The counter is annotated `to_duplicate`.
pub fn counter_module() -> Module {
    let mut m = Module::new("counter");
    let i32t = m.tys.i32;
    let void = m.tys.void;
    let print = new_func(&mut m, "print", void, &[("v", i32t)]);

    let zero_init = m.const_i32(0);
    let mut counter_gv = GlobalVar::new("counter", i32t);
    counter_gv.init = Some(zero_init);
    let counter = m.add_global(counter_gv);
    add_annotation(&mut m, Value::Global(counter), "to_duplicate");

    let incr = new_func(&mut m, "incr", void, &[]);
    {
        let bb = m.new_block(incr, "entry");
        let one = i32c(&mut m, 1);
        let mut b = Builder::at_end(&mut m, bb);
        let cv = b.load(i32t, Value::Global(counter));
        let cv1 = b.add(i32t, Value::Inst(cv), one);
        b.store(Value::Inst(cv1), Value::Global(counter));
        let cv2 = b.load(i32t, Value::Global(counter));
        let cv3 = b.add(i32t, Value::Inst(cv2), one);
        b.store(Value::Inst(cv3), Value::Global(counter));
        b.ret_void();
        name(&mut m, cv, "cv");
        name(&mut m, cv1, "cv1");
        name(&mut m, cv2, "cv2");
        name(&mut m, cv3, "cv3");
    }

    let show = new_func(&mut m, "show", void, &[]);
    {
        let bb = m.new_block(show, "entry");
        let mut b = Builder::at_end(&mut m, bb);
        let cv = b.load(i32t, Value::Global(counter));
        b.call(Callee::Direct(print), void, vec![Value::Inst(cv)]);
        b.ret_void();
        name(&mut m, cv, "shown");
    }

    let main = new_func(&mut m, "main", i32t, &[]);
    let bb = m.new_block(main, "entry");
    let zero = i32c(&mut m, 0);
    let mut b = Builder::at_end(&mut m, bb);
    b.call(Callee::Direct(incr), void, vec![]);
    b.call(Callee::Direct(show), void, vec![]);
    b.ret(zero);
    m
}

/// Signal-flag program: a registered handler sets a flag, `raise` invokes
/// it, and `main` prints one of two FNV-1a checksums plus sentinels.
pub fn signal_module() -> Module {
    let mut m = Module::new("signal");
    let i32t = m.tys.i32;
    let i8t = m.tys.i8;
    let void = m.tys.void;
    let ptr = m.tys.ptr;
    let print = new_func(&mut m, "print", void, &[("v", i32t)]);
    let signal = new_func(&mut m, "signal", i32t, &[("sig", i32t), ("handler", ptr)]);
    let raise = new_func(&mut m, "raise", i32t, &[("sig", i32t)]);

    let msg_init = m.const_bytes(b"HELLOWORLD".to_vec());
    let msg_ty = m.const_type(msg_init);
    let mut msg_gv = GlobalVar::new("msg", msg_ty);
    msg_gv.is_const = true;
    msg_gv.init = Some(msg_init);
    let msg = m.add_global(msg_gv);

    let zero_init = m.const_i32(0);
    let mut flag_gv = GlobalVar::new("flag", i32t);
    flag_gv.init = Some(zero_init);
    let flag = m.add_global(flag_gv);

    let handler = new_func(&mut m, "handler", void, &[]);
    {
        let bb = m.new_block(handler, "entry");
        let one = i32c(&mut m, 1);
        let mut b = Builder::at_end(&mut m, bb);
        b.store(one, Value::Global(flag));
        b.ret_void();
    }

    // fnv(seed): FNV-1a over msg
    let fnv = new_func(&mut m, "fnv", i32t, &[("seed", i32t)]);
    {
        let entry = m.new_block(fnv, "entry");
        let cond = m.new_block(fnv, "cond");
        let body = m.new_block(fnv, "body");
        let exit = m.new_block(fnv, "exit");
        let zero = i32c(&mut m, 0);
        let one = i32c(&mut m, 1);
        let ten = i32c(&mut m, 10);
        let prime = i32c(&mut m, 16777619);

        let mut b = Builder::at_end(&mut m, entry);
        let h_slot = b.alloca(i32t);
        b.store(Value::Arg(fnv, 0), Value::Inst(h_slot));
        let i_slot = b.alloca(i32t);
        b.store(zero, Value::Inst(i_slot));
        b.br(cond);
        name(&mut m, h_slot, "h_slot");
        name(&mut m, i_slot, "i_slot");

        let mut b = Builder::at_end(&mut m, cond);
        let i = b.load(i32t, Value::Inst(i_slot));
        let c = b.icmp(IntPred::Slt, Value::Inst(i), ten);
        b.cond_br(Value::Inst(c), body, exit);
        name(&mut m, i, "i");

        let mut b = Builder::at_end(&mut m, body);
        let p = b.gep(i8t, Value::Global(msg), vec![Value::Inst(i)]);
        let ch = b.load(i8t, Value::Inst(p));
        let ch32 = b.cast(aspis_ir::CastOp::ZExt, i32t, Value::Inst(ch));
        let h = b.load(i32t, Value::Inst(h_slot));
        let x = b.bin(aspis_ir::BinOp::Xor, i32t, Value::Inst(h), Value::Inst(ch32));
        let h2 = b.bin(aspis_ir::BinOp::Mul, i32t, Value::Inst(x), prime);
        b.store(Value::Inst(h2), Value::Inst(h_slot));
        let i2 = b.add(i32t, Value::Inst(i), one);
        b.store(Value::Inst(i2), Value::Inst(i_slot));
        b.br(cond);
        name(&mut m, h2, "h2");

        let mut b = Builder::at_end(&mut m, exit);
        let h = b.load(i32t, Value::Inst(h_slot));
        b.ret(Value::Inst(h));
        name(&mut m, h, "h_final");
    }

    let main = new_func(&mut m, "main", i32t, &[]);
    {
        let entry = m.new_block(main, "entry");
        let armed = m.new_block(main, "armed");
        let idle = m.new_block(main, "idle");
        let out = m.new_block(main, "out");
        let zero = i32c(&mut m, 0);
        let one = i32c(&mut m, 1);
        let ten = i32c(&mut m, 10);
        let basis_a = i32c(&mut m, 0x811C9DC5u32 as i64);
        let basis_b = i32c(&mut m, 777);
        let sentinel_a = i32c(&mut m, 42);
        let sentinel_b = i32c(&mut m, 7);

        let mut b = Builder::at_end(&mut m, entry);
        b.call(
            Callee::Direct(signal),
            i32t,
            vec![ten, Value::Func(handler)],
        );
        b.call(Callee::Direct(raise), i32t, vec![ten]);
        let f = b.load(i32t, Value::Global(flag));
        let c = b.icmp(IntPred::Eq, Value::Inst(f), one);
        b.cond_br(Value::Inst(c), armed, idle);
        name(&mut m, f, "flag_val");

        let mut b = Builder::at_end(&mut m, armed);
        let s1 = b.call(Callee::Direct(fnv), i32t, vec![basis_a]);
        b.call(Callee::Direct(print), void, vec![Value::Inst(s1)]);
        b.br(out);

        let mut b = Builder::at_end(&mut m, idle);
        let s2 = b.call(Callee::Direct(fnv), i32t, vec![basis_b]);
        b.call(Callee::Direct(print), void, vec![Value::Inst(s2)]);
        b.br(out);

        let mut b = Builder::at_end(&mut m, out);
        b.call(Callee::Direct(print), void, vec![sentinel_a]);
        b.call(Callee::Direct(print), void, vec![sentinel_b]);
        b.ret(zero);
    }
    m
}

/// A single fault to inject: flip `bit` of the named value's nth
/// definition inside `func`.
#[derive(Clone)]
pub struct FaultSpec {
    pub func: &'static str,
    pub value: &'static str,
    pub occurrence: u64,
    pub bit: u32,
}

/// Runs `main`, collecting `print` output as decimal lines. `signal` and
/// `raise` hosts are always registered so the signal scenario works for
/// both the reference and hardened builds.
pub fn run_program(m: &Module, fault: Option<FaultSpec>) -> (Vec<String>, Result<Val, ExecError>) {
    let out: Rc<RefCell<Vec<String>>> = Rc::default();
    let mut mach = Machine::new(m);

    let sink = out.clone();
    mach.register_host("print", move |_mach, args| {
        let v = args.first().and_then(Val::as_i64).unwrap_or(0);
        sink.borrow_mut().push(v.to_string());
        Ok(Val::Undef)
    });

    let handler_cell: Rc<RefCell<Option<Val>>> = Rc::default();
    let store_cell = handler_cell.clone();
    mach.register_host("signal", move |_mach, args| {
        *store_cell.borrow_mut() = args.get(1).cloned();
        Ok(Val::int(32, 0))
    });
    let read_cell = handler_cell.clone();
    mach.register_host("raise", move |mach, _args| {
        let target = read_cell.borrow().clone();
        if let Some(Val::Fn(f)) = target {
            mach.call_function(f, vec![])?;
        }
        Ok(Val::int(32, 0))
    });

    if let Some(spec) = fault {
        mach.set_fault_hook(Box::new(move |site, val| {
            if site.func == spec.func
                && site.value == spec.value
                && site.occurrence == spec.occurrence
            {
                if let Val::Int { bits, v } = *val {
                    *val = Val::int(bits, v ^ (1u64 << spec.bit));
                }
            }
        }));
    }

    let result = mach.run("main", vec![]);
    (out.take(), result)
}
