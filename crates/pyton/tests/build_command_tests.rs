//! End-to-end coverage of the scenarios a `pyton build` invocation must
//! handle, exercised directly against `pyton_core` rather than spawning the
//! binary (`spec.md` §8's named scenarios).

use pyton_core::{PipelineConfig, PytonPipeline};
use std::fs;
use tempfile::tempdir;

#[test]
fn hello_world_produces_a_linkable_translation_unit() {
    let dir = tempdir().unwrap();
    let entry = dir.path().join("main.py");
    fs::write(&entry, "print(\"hello\")\n").unwrap();

    let out = PytonPipeline::new().transpile(&entry).unwrap();
    assert!(out.contains("#include \"pyton_runtime.h\""));
    assert!(out.contains("DEFINE_ENTRYPOINT"));
    assert!(out.contains("pyglobal__print"));
}

#[test]
fn selective_import_pulls_in_the_target_module() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("main.py"), "from other import greet\ngreet()\n").unwrap();
    fs::write(dir.path().join("other.py"), "def greet():\n    print(\"hi\")\n").unwrap();

    let out = PytonPipeline::new().transpile(&dir.path().join("main.py")).unwrap();
    assert!(out.contains("pyfn__other_greet"));
    assert!(out.contains("MODULE_INIT_STATE(other)"));
}

#[test]
fn full_import_is_rejected_as_an_explicit_non_goal() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("main.py"), "import other\n").unwrap();
    fs::write(dir.path().join("other.py"), "pass\n").unwrap();

    let err = PytonPipeline::new()
        .transpile(&dir.path().join("main.py"))
        .unwrap_err();
    assert!(err.to_string().contains("failed to transpile"));
}

#[test]
fn class_body_assigns_go_through_setattr_not_store_name() {
    let dir = tempdir().unwrap();
    let entry = dir.path().join("main.py");
    fs::write(&entry, "class K:\n    x = 1\n").unwrap();

    let out = PytonPipeline::new().transpile(&entry).unwrap();
    assert!(out.contains("pyfn____main___K"));
}

#[test]
fn try_except_toggles_the_exception_handler_label() {
    let dir = tempdir().unwrap();
    let entry = dir.path().join("main.py");
    fs::write(
        &entry,
        "try:\n    print(\"a\")\nexcept Exception:\n    print(\"b\")\n",
    )
    .unwrap();

    let out = PytonPipeline::new().transpile(&entry).unwrap();
    assert!(out.contains("PY__EXCEPTION_HANDLER_LABEL"));
}

#[test]
fn module_root_override_resolves_imports_outside_the_entry_directory() {
    let workdir = tempdir().unwrap();
    let libdir = tempdir().unwrap();
    fs::write(workdir.path().join("main.py"), "from other import greet\ngreet()\n").unwrap();
    fs::write(libdir.path().join("other.py"), "def greet():\n    print(\"hi\")\n").unwrap();

    let pipeline = PytonPipeline::with_config(PipelineConfig {
        module_root: Some(libdir.path().to_path_buf()),
    });
    let out = pipeline.transpile(&workdir.path().join("main.py")).unwrap();
    assert!(out.contains("pyfn__other_greet"));
}

#[test]
fn transpiling_the_same_entry_twice_is_byte_identical() {
    let dir = tempdir().unwrap();
    let entry = dir.path().join("main.py");
    fs::write(&entry, "print(\"hi\")\nx = 1\ny = 2.5\n").unwrap();

    let pipeline = PytonPipeline::new();
    let first = pipeline.transpile(&entry).unwrap();
    let second = pipeline.transpile(&entry).unwrap();
    assert_eq!(first, second);
}
