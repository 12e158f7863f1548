//! End-to-end debugger behavior against a scripted XBDM.

mod support;

use std::sync::Arc;

use support::{wait_until, MockReply, MockXbdm};
use xbdm::debugger::{AttachState, BreakpointKind};
use xbdm::net::Reactor;
use xbdm::{XbdmContext, XbdmDebugger};

fn attach_debugger(mock: &MockXbdm, reactor: &Reactor) -> Arc<XbdmDebugger> {
    let context = XbdmContext::new(mock.endpoint, reactor.handle());
    let debugger = XbdmDebugger::new(context);
    debugger.attach().expect("attach");
    debugger
}

#[test]
fn attach_walks_the_connect_handshake() {
    let mock = MockXbdm::start();
    let reactor = Reactor::start();
    let debugger = attach_debugger(&mock, &reactor);

    assert_eq!(debugger.attach_state(), AttachState::Running);
    assert_eq!(mock.shared.commands_matching("debugger connect").len(), 1);
    assert_eq!(mock.shared.commands_matching("stopon all").len(), 1);
    assert!(mock.shared.has_notification_channel());

    // The initial sweep populated the model.
    assert_eq!(debugger.threads().len(), 1);
    assert_eq!(debugger.modules().len(), 2);
    assert_eq!(debugger.memory_map().len(), 2);
    assert_eq!(debugger.any_thread_id(), Some(1));
}

#[test]
fn memory_reads_round_trip_through_getmem2() {
    let mock = MockXbdm::start();
    mock.shared.poke(0x10000, &[0xde, 0xad, 0xbe, 0xef]);

    let reactor = Reactor::start();
    let debugger = attach_debugger(&mock, &reactor);

    let bytes = debugger.get_memory(0x10000, 4).expect("read");
    assert_eq!(bytes, vec![0xde, 0xad, 0xbe, 0xef]);
    assert_eq!(
        mock.shared.commands_matching("getmem2 ADDR=0x10000 LENGTH=0x4").len(),
        1
    );
}

#[test]
fn large_writes_split_into_setmem_chunks() {
    let mock = MockXbdm::start();
    let reactor = Reactor::start();
    let debugger = attach_debugger(&mock, &reactor);

    let data: Vec<u8> = (0..=255).cycle().take(500).map(|b| b as u8).collect();
    debugger.set_memory(0x20000, &data).expect("write");

    let writes = mock.shared.commands_matching("setmem");
    assert_eq!(writes.len(), 3); // 240 + 240 + 20
    assert!(writes[0].starts_with("setmem addr=0x20000 "));
    assert!(writes[1].starts_with("setmem addr=0x200f0 "));
    assert!(writes[2].starts_with("setmem addr=0x201e0 "));

    // What the mock's memory now holds is exactly what was written.
    assert_eq!(mock.shared.peek(0x20000, 500), data);
}

#[test]
fn breakpoint_failures_roll_back_the_registry() {
    let mock = MockXbdm::start();
    let reactor = Reactor::start();
    let debugger = attach_debugger(&mock, &reactor);

    debugger
        .add_breakpoint(BreakpointKind::Execute, 0x8004_1000, 1)
        .expect("add breakpoint");
    assert_eq!(debugger.breakpoints().len(), 1);

    mock.respond_status("break", "405- no such thread");
    let err = debugger
        .add_breakpoint(BreakpointKind::WriteWatch, 0xd000_0000, 4)
        .unwrap_err();
    assert!(matches!(err, xbdm::Error::Target { .. }));
    // The failed install did not leak into the registry.
    assert_eq!(debugger.breakpoints().len(), 1);

    mock.respond_status("break", "200- OK");
    debugger
        .remove_breakpoint(BreakpointKind::Execute, 0x8004_1000, 1)
        .expect("remove breakpoint");
    assert!(debugger.breakpoints().is_empty());
    assert_eq!(mock.shared.commands_matching("break addr=0x80041000 clear").len(), 1);
}

#[test]
fn stop_notifications_move_the_state_machine() {
    let mock = MockXbdm::start();
    let reactor = Reactor::start();
    let debugger = attach_debugger(&mock, &reactor);

    mock.shared.notify("break thread=1 addr=0x80041000");
    wait_until("stop notification", || {
        debugger.attach_state() == AttachState::Stopped
    });

    let thread = debugger.thread(1).expect("thread 1");
    assert!(thread.stopped);
    let reason = thread.last_stop_reason.expect("stop reason");
    assert_eq!(reason.thread_id(), Some(1));
    assert_eq!(reason.signal(), 5);
    assert_eq!(debugger.active_thread_id(), Some(1));

    debugger.go().expect("go");
    assert_eq!(debugger.attach_state(), AttachState::Running);
    assert!(debugger.thread(1).unwrap().last_stop_reason.is_none());
}

#[test]
fn reboot_storm_flushes_and_reattaches() {
    let mock = MockXbdm::start();
    let reactor = Reactor::start();
    let debugger = attach_debugger(&mock, &reactor);

    debugger
        .add_breakpoint(BreakpointKind::Execute, 0x8004_1000, 1)
        .expect("add breakpoint");
    let breaks_before = mock.shared.commands_matching("break addr=0x80041000").len();

    mock.shared.notify("execution rebooting");
    wait_until("reboot flush", || {
        debugger.attach_state() == AttachState::Rebooting && debugger.threads().is_empty()
    });
    assert!(debugger.modules().is_empty());
    assert!(debugger.memory_map().is_empty());

    mock.shared.notify("execution pending");
    wait_until("reattach handshake", || {
        mock.shared.commands_matching("debugger connect").len() == 2
    });

    mock.shared.notify("execution started");
    wait_until("running after reboot", || {
        debugger.attach_state() == AttachState::Running && !debugger.threads().is_empty()
    });

    // The registered breakpoint was reinstalled on the fresh target.
    wait_until("breakpoint reinstall", || {
        mock.shared.commands_matching("break addr=0x80041000").len() == breaks_before + 1
    });
}

#[test]
fn vanished_threads_are_dropped_without_error() {
    let mock = MockXbdm::start();
    mock.respond("threads", |_, _| {
        MockReply::Multiline(vec!["1".to_owned(), "2".to_owned()])
    });
    mock.respond("threadinfo", |line, _| {
        if line.contains("thread=0x2") {
            MockReply::Status("405- no such thread")
        } else {
            MockReply::Multiline(vec!["suspend=0 priority=8 start=0x10000".to_owned()])
        }
    });

    let reactor = Reactor::start();
    let debugger = attach_debugger(&mock, &reactor);

    let ids: Vec<u32> = debugger.threads().iter().map(|t| t.thread_id).collect();
    assert_eq!(ids, vec![1]);
}

#[test]
fn isstopped_surfaces_typed_stop_reasons() {
    let mock = MockXbdm::start();
    mock.respond(
        "isstopped",
        |_, _| MockReply::Status("200- break thread=1 addr=0x80041000"),
    );

    let reactor = Reactor::start();
    let debugger = attach_debugger(&mock, &reactor);

    let reason = debugger
        .fetch_stop_reason(1)
        .expect("isstopped")
        .expect("reason");
    assert_eq!(reason.thread_id(), Some(1));
}
