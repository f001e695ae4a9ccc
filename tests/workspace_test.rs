use std::{fs, sync::Arc, thread};

use pybridge::{ScriptScope, Workspace};

#[test]
fn test_parallel_scopes_share_one_directory() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("ws");
    let ws = Workspace::new(&root);

    // One scope held open for the whole test keeps the directory alive.
    let mut anchor = ScriptScope::new("pass");
    anchor.initialize(&ws, false, false).unwrap();

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let ws = Arc::clone(&ws);
            thread::spawn(move || {
                for i in 0..50 {
                    let mut scope = ScriptScope::new(format!("output = {}", t * 100 + i));
                    let path = scope.initialize(&ws, false, true).unwrap();
                    assert!(path.starts_with(ws.root()));
                    let text = fs::read_to_string(&path).unwrap();
                    assert!(text.contains(&format!("output = {}", t * 100 + i)));
                    scope.clean();
                    assert!(!path.exists());
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert!(root.join("pybridge.py").is_file());
    assert_eq!(ws.active_count(), 1);
    anchor.clean();
    assert_eq!(ws.active_count(), 0);
    assert!(!root.exists());
}

#[test]
fn test_directory_recreated_after_full_release() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("ws");
    let ws = Workspace::new(&root);

    for _ in 0..3 {
        let mut lease = ws.acquire().unwrap();
        let file = lease.create_temp_file("print('hi')\n").unwrap();
        assert!(file.exists());
        assert!(root.join("pybridge.py").exists());
        lease.release(false);
        assert!(!root.exists());
    }
}

#[test]
fn test_dropped_scope_cleans_up() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("ws");
    let ws = Workspace::new(&root);

    let path = {
        let mut scope = ScriptScope::new("output = 1");
        scope.initialize(&ws, false, true).unwrap()
    };
    assert!(!path.exists());
    assert_eq!(ws.active_count(), 0);
    assert!(!root.exists());
}
