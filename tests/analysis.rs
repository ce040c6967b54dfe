mod common;

use std::error::Error;
use std::sync::Arc;
use std::thread;

use jdataflow::analyses::Constant;
use jdataflow::cache::AnalysisEngine;
use jdataflow::descriptor::{ClassDescriptor, MethodDescriptor};
use jdataflow::engines::{
    CallListDataflowEngine, CfgEngine, ClassInfoEngine, ConstantDataflowEngine, ObligationDataflowEngine,
    analyze_class, analyze_method,
};
use jdataflow::opcodes::*;
use jdataflow::{AnalysisConfig, AnalysisContext, AnalysisError};

use common::{ACC_ABSTRACT, ACC_PUBLIC, ACC_STATIC, ClassFileBuilder, Code, index};

const PICKER: &str = "com/example/Picker";
const PICK_SIGNATURE: &str = "(I)Ljava/lang/String;";

fn context() -> AnalysisContext {
    AnalysisContext::new(AnalysisConfig::default()).expect("context")
}

/// `static String pick(int flag) { String s = flag == 0 ? then : otherwise; return s; }`
fn picker_class(then: &str, otherwise: &str) -> Vec<u8> {
    let mut class = ClassFileBuilder::new(PICKER);
    let then = class.string(then) as u8;
    let otherwise = class.string(otherwise) as u8;
    let code = vec![
        ILOAD_0, IFEQ, 0, 8, LDC, otherwise, GOTO, 0, 5, LDC, then, ASTORE_1, ALOAD_1, ARETURN,
    ];
    class.method(ACC_PUBLIC | ACC_STATIC, "pick", PICK_SIGNATURE, Some(Code::new(1, 2, code)), &[]);
    class.build()
}

fn pick_method() -> MethodDescriptor {
    MethodDescriptor::new(ClassDescriptor::new(PICKER), "pick", PICK_SIGNATURE, true)
}

fn local_one_at(ctx: &AnalysisContext, offset: u32) -> Constant {
    let result = ctx.get::<ConstantDataflowEngine>(&pick_method()).expect("constants");
    let location = result.cfg().location_of(offset).expect("location");
    result
        .fact_at_location(location)
        .expect("fact")
        .local(1)
        .expect("local")
        .clone()
}

#[test]
fn same_literal_on_both_paths_survives_the_join() {
    let ctx = context();
    let class = ctx.add_class(picker_class("hi", "hi"), "Picker.class").expect("load");
    assert_eq!(class, ClassDescriptor::new(PICKER));

    assert_eq!(local_one_at(&ctx, 12), Constant::String("hi".to_string()));
}

#[test]
fn reload_with_changed_bytes_invalidates_cached_results() {
    let ctx = context();
    let class = ctx.add_class(picker_class("hi", "hi"), "Picker.class").expect("load");

    let first = ctx.get::<ConstantDataflowEngine>(&pick_method()).expect("constants");
    assert!(!ctx.reload_class(&class, picker_class("hi", "hi")));
    let unchanged = ctx.get::<ConstantDataflowEngine>(&pick_method()).expect("constants");
    assert!(Arc::ptr_eq(&first, &unchanged));

    assert!(ctx.reload_class(&class, picker_class("hi", "bye")));
    assert_eq!(local_one_at(&ctx, 12), Constant::NotConstant);

    let location = first.cfg().location_of(12).expect("location");
    let old_frame = first.fact_at_location(location).expect("fact");
    assert_eq!(old_frame.local(1).expect("local"), &Constant::String("hi".to_string()));
    assert_eq!(ctx.profiler().count(ConstantDataflowEngine::NAME), 2);
}

#[test]
fn method_failures_stay_local_to_the_method() {
    let mut class = ClassFileBuilder::new("com/example/Mixed");
    class.method(ACC_PUBLIC, "good", "()V", Some(Code::new(0, 1, vec![RETURN])), &[]);
    class.method(ACC_PUBLIC, "broken", "()V", Some(Code::new(0, 1, vec![NOP])), &[]);
    class.method(ACC_PUBLIC | ACC_ABSTRACT, "todo", "()V", None, &[]);

    let ctx = context();
    let descriptor = ctx.add_class(class.build(), "Mixed.class").expect("load");
    let outcomes = analyze_class(&ctx, &descriptor).expect("class analysis");

    let names: Vec<&str> = outcomes.iter().map(|(method, _)| method.name()).collect();
    assert_eq!(names, vec!["good", "broken", "todo"]);

    let good = outcomes[0].1.as_ref().expect("good").as_ref().expect("summary");
    assert_eq!(good.blocks, 3);
    assert_eq!(good.unbalanced_obligations, 0);

    let broken = outcomes[1].1.as_ref().expect_err("broken");
    assert!(matches!(broken, AnalysisError::CacheComputation { kind: "cfg", .. }));
    let source = broken
        .source()
        .and_then(|source| source.downcast_ref::<AnalysisError>())
        .expect("source");
    assert!(matches!(source, AnalysisError::MalformedControlFlow { .. }));

    assert!(matches!(outcomes[2].1, Ok(None)));
}

#[test]
fn undecodable_method_does_not_reject_its_class() {
    let mut class = ClassFileBuilder::new("com/example/Jumpy");
    class.method(ACC_PUBLIC, "good", "()V", Some(Code::new(0, 1, vec![RETURN])), &[]);
    class.method(ACC_PUBLIC, "broken", "()V", Some(Code::new(0, 1, vec![GOTO, 0xff, 0xf0])), &[]);

    let ctx = context();
    let descriptor = ctx.add_class(class.build(), "Jumpy.class").expect("class loads");
    let good = MethodDescriptor::new(descriptor.clone(), "good", "()V", false);
    let broken = MethodDescriptor::new(descriptor, "broken", "()V", false);

    let summary = analyze_method(&ctx, &good).expect("good analyzes").expect("code");
    assert_eq!(summary.unbalanced_obligations, 0);

    let err = analyze_method(&ctx, &broken).expect_err("broken fails");
    assert!(matches!(err, AnalysisError::CacheComputation { kind: "cfg", .. }));
    assert!(matches!(err.root_cause(), AnalysisError::MalformedControlFlow { .. }));
    assert!(err.is_method_local());
}

#[test]
fn added_class_is_not_parsed_again() {
    let ctx = context();
    let class = ctx.add_class(picker_class("hi", "bye"), "Picker.class").expect("load");

    let info = ctx.get::<ClassInfoEngine>(&class).expect("class info");
    assert_eq!(info.methods.len(), 1);
    assert!(Arc::ptr_eq(&info, &ctx.get::<ClassInfoEngine>(&class).expect("class info")));
    assert_eq!(ctx.profiler().count(ClassInfoEngine::NAME), 0);

    // Changed bytes drop the seeded parse along with everything else.
    assert!(ctx.reload_class(&class, picker_class("hi", "hi")));
    ctx.get::<ClassInfoEngine>(&class).expect("class info");
    assert_eq!(ctx.profiler().count(ClassInfoEngine::NAME), 1);
}

#[test]
fn unreadable_class_bytes_are_rejected() {
    let ctx = context();
    let err = ctx.add_class(vec![0xCA, 0xFE, 0xBA, 0xBE, 0], "Truncated.class").expect_err("truncated");
    assert!(matches!(err, AnalysisError::MalformedClass { ref class, .. } if class == "Truncated.class"));
    assert_eq!(ctx.class_count(), 0);
}

fn stream_class(close: bool) -> Vec<u8> {
    let mut class = ClassFileBuilder::new("com/example/Streams");
    let stream = class.class("java/io/FileInputStream");
    let init = class.method_ref("java/io/FileInputStream", "<init>", "(Ljava/lang/String;)V");
    let close_ref = class.method_ref("java/io/FileInputStream", "close", "()V");

    let mut code = vec![NEW];
    code.extend(index(stream));
    code.extend([DUP, ACONST_NULL, INVOKESPECIAL]);
    code.extend(index(init));
    code.push(ASTORE_0);
    if close {
        code.extend([ALOAD_0, INVOKEVIRTUAL]);
        code.extend(index(close_ref));
    }
    code.push(RETURN);

    class.method(ACC_PUBLIC | ACC_STATIC, "open", "()V", Some(Code::new(3, 1, code)), &[]);
    class.build()
}

#[test]
fn unclosed_stream_leaves_an_unbalanced_obligation() {
    let ctx = context();
    ctx.add_class(stream_class(false), "Streams.class").expect("load");
    let method = MethodDescriptor::new(ClassDescriptor::new("com/example/Streams"), "open", "()V", true);

    let summary = analyze_method(&ctx, &method).expect("analysis").expect("code");
    assert_eq!(summary.unbalanced_obligations, 1);

    let input_stream = ctx.obligation_factory().obligation("java/io/InputStream");
    let result = ctx.get::<ObligationDataflowEngine>(&method).expect("obligations");
    assert!(result.unbalanced_ids().contains(&input_stream.id()));

    let calls = ctx.get::<CallListDataflowEngine>(&method).expect("calls");
    let exit = calls.fact_at_end();
    assert_eq!(exit.to_string(), "[java/io/FileInputStream.<init>(Ljava/lang/String;)V]");
}

#[test]
fn closed_stream_is_balanced() {
    let ctx = context();
    ctx.add_class(stream_class(true), "Streams.class").expect("load");
    let method = MethodDescriptor::new(ClassDescriptor::new("com/example/Streams"), "open", "()V", true);

    let summary = analyze_method(&ctx, &method).expect("analysis").expect("code");
    assert_eq!(summary.unbalanced_obligations, 0);
}

#[test]
fn concurrent_requests_compute_once() {
    let ctx = context();
    ctx.add_class(picker_class("hi", "bye"), "Picker.class").expect("load");
    let method = pick_method();

    let results: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| scope.spawn(|| ctx.get::<CfgEngine>(&method).expect("cfg")))
            .collect();
        handles.into_iter().map(|handle| handle.join().expect("join")).collect()
    });

    assert!(results.iter().all(|cfg| Arc::ptr_eq(cfg, &results[0])));
    assert_eq!(ctx.profiler().count(CfgEngine::NAME), 1);
}
