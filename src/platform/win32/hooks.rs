//! `WH_KEYBOARD_LL` / `WH_MOUSE_LL` hooks, each pumped by its own thread.
//!
//! Low-level hook procedures are plain `extern "system"` functions, so the
//! active handler lives in a process-wide slot the procedure reads on every
//! event. The OS calls the procedure on the installing thread, which therefore
//! runs a message loop until it receives `WM_QUIT`.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock, mpsc};
use std::thread::JoinHandle;

use windows::Win32::Foundation::{HINSTANCE, LPARAM, LRESULT, WPARAM};
use windows::Win32::System::LibraryLoader::GetModuleHandleW;
use windows::Win32::System::Threading::GetCurrentThreadId;
use windows::Win32::UI::Input::KeyboardAndMouse::{
    GetAsyncKeyState, VIRTUAL_KEY, VK_CONTROL, VK_LWIN, VK_MENU, VK_RWIN, VK_SHIFT,
};
use windows::Win32::UI::WindowsAndMessaging::{
    CallNextHookEx, GetMessageW, HOOKPROC, KBDLLHOOKSTRUCT, MSG, MSLLHOOKSTRUCT, PM_NOREMOVE,
    PeekMessageW, PostThreadMessageW, SetWindowsHookExW, UnhookWindowsHookEx, WH_KEYBOARD_LL,
    WH_MOUSE_LL, WINDOWS_HOOK_ID, WM_KEYDOWN, WM_LBUTTONDOWN, WM_MBUTTONDOWN, WM_QUIT,
    WM_RBUTTONDOWN, WM_SYSKEYDOWN, WM_USER, WM_XBUTTONDOWN, WM_XBUTTONUP,
};
use windows::core::PCWSTR;

use crate::platform::{
    HookDecision, InputHooks, KeyboardHandler, MouseButton, MouseHandler, PlatformError,
    PlatformResult,
};
use crate::policy::{KeyCode, KeyCombo, Modifiers};

static KEYBOARD: RwLock<Option<KeyboardHandler>> = RwLock::new(None);
static MOUSE: RwLock<Option<MouseHandler>> = RwLock::new(None);

/// X buttons whose down event was suppressed; their up event is swallowed too.
static SUPPRESSED_X: AtomicU8 = AtomicU8::new(0);

const XBUTTON1: u16 = 1;
const XBUTTON2: u16 = 2;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn set_slot<T>(slot: &RwLock<Option<T>>, value: Option<T>) {
    *slot.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = value;
}

fn current<T: Clone>(slot: &RwLock<Option<T>>) -> Option<T> {
    slot.read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

fn is_down(key: VIRTUAL_KEY) -> bool {
    // SAFETY: no preconditions. The high bit reports the key as held.
    unsafe { GetAsyncKeyState(key.0 as i32) } < 0
}

fn held_modifiers() -> Modifiers {
    let mut modifiers = Modifiers::NONE;
    if is_down(VK_CONTROL) {
        modifiers.insert(Modifiers::CTRL);
    }
    if is_down(VK_MENU) {
        modifiers.insert(Modifiers::ALT);
    }
    if is_down(VK_SHIFT) {
        modifiers.insert(Modifiers::SHIFT);
    }
    if is_down(VK_LWIN) || is_down(VK_RWIN) {
        modifiers.insert(Modifiers::WIN);
    }
    modifiers
}

/// Run a handler without letting a panic unwind into the OS.
fn decide<F: FnOnce() -> HookDecision>(f: F) -> HookDecision {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or(HookDecision::Forward)
}

unsafe extern "system" fn keyboard_proc(code: i32, wparam: WPARAM, lparam: LPARAM) -> LRESULT {
    let message = wparam.0 as u32;
    if code >= 0 && (message == WM_KEYDOWN || message == WM_SYSKEYDOWN) {
        // SAFETY: for WH_KEYBOARD_LL, lparam points at a KBDLLHOOKSTRUCT.
        let info = unsafe { &*(lparam.0 as *const KBDLLHOOKSTRUCT) };
        let event = KeyCombo::new(held_modifiers(), KeyCode::from_vk(info.vkCode as u16));
        if let Some(handler) = current(&KEYBOARD)
            && decide(|| handler(event)) == HookDecision::Suppress
        {
            return LRESULT(1);
        }
    }
    // SAFETY: forwards the untouched arguments.
    unsafe { CallNextHookEx(None, code, wparam, lparam) }
}

fn x_bit(button: u16) -> u8 {
    match button {
        XBUTTON1 => 1,
        XBUTTON2 => 2,
        _ => 0,
    }
}

unsafe extern "system" fn mouse_proc(code: i32, wparam: WPARAM, lparam: LPARAM) -> LRESULT {
    if code >= 0 {
        // SAFETY: for WH_MOUSE_LL, lparam points at an MSLLHOOKSTRUCT.
        let info = unsafe { &*(lparam.0 as *const MSLLHOOKSTRUCT) };
        let x_button = (info.mouseData >> 16) as u16;
        let button = match wparam.0 as u32 {
            WM_LBUTTONDOWN => Some(MouseButton::Left),
            WM_RBUTTONDOWN => Some(MouseButton::Right),
            WM_MBUTTONDOWN => Some(MouseButton::Middle),
            WM_XBUTTONDOWN if x_button == XBUTTON1 => Some(MouseButton::Back),
            WM_XBUTTONDOWN if x_button == XBUTTON2 => Some(MouseButton::Forward),
            WM_XBUTTONUP => {
                let bit = x_bit(x_button);
                if bit != 0 && SUPPRESSED_X.fetch_and(!bit, Ordering::SeqCst) & bit != 0 {
                    return LRESULT(1);
                }
                None
            }
            _ => None,
        };
        if let Some(button) = button
            && let Some(handler) = current(&MOUSE)
            && decide(|| handler(button)) == HookDecision::Suppress
        {
            SUPPRESSED_X.fetch_or(x_bit(x_button), Ordering::SeqCst);
            return LRESULT(1);
        }
    }
    // SAFETY: forwards the untouched arguments.
    unsafe { CallNextHookEx(None, code, wparam, lparam) }
}

struct HookThread {
    thread_id: u32,
    join: JoinHandle<()>,
}

impl HookThread {
    fn spawn(name: &str, kind: WINDOWS_HOOK_ID, proc: HOOKPROC) -> PlatformResult<Self> {
        let (ready_tx, ready_rx) = mpsc::channel::<Result<u32, String>>();
        let join = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut msg = MSG::default();
                // SAFETY: creates this thread's message queue so WM_QUIT can be posted.
                let _ = unsafe { PeekMessageW(&mut msg, None, WM_USER, WM_USER, PM_NOREMOVE) };
                // SAFETY: null module name means the current executable.
                let module = unsafe { GetModuleHandleW(PCWSTR::null()) }
                    .ok()
                    .map(HINSTANCE::from);
                // SAFETY: `proc` is a valid hook procedure for `kind`.
                let hook = match unsafe { SetWindowsHookExW(kind, proc, module, 0) } {
                    Ok(hook) => hook,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.message()));
                        return;
                    }
                };
                // SAFETY: no preconditions.
                let _ = ready_tx.send(Ok(unsafe { GetCurrentThreadId() }));
                // SAFETY: `msg` is a valid out-buffer; loop ends on WM_QUIT or error.
                while unsafe { GetMessageW(&mut msg, None, 0, 0) }.as_bool() {}
                // SAFETY: the hook was installed by this thread.
                let _ = unsafe { UnhookWindowsHookEx(hook) };
            })?;

        match ready_rx.recv() {
            Ok(Ok(thread_id)) => Ok(Self { thread_id, join }),
            Ok(Err(message)) => {
                let _ = join.join();
                Err(PlatformError::os("SetWindowsHookExW", message))
            }
            Err(_) => {
                let _ = join.join();
                Err(PlatformError::os("SetWindowsHookExW", "hook thread exited"))
            }
        }
    }

    fn stop(self) -> PlatformResult<()> {
        // SAFETY: posting to a thread id we created.
        unsafe { PostThreadMessageW(self.thread_id, WM_QUIT, WPARAM(0), LPARAM(0)) }
            .map_err(|e| PlatformError::os("PostThreadMessageW", e.message()))?;
        self.join
            .join()
            .map_err(|_| PlatformError::os("UnhookWindowsHookEx", "hook thread panicked"))
    }
}

#[derive(Default)]
pub struct LowLevelHooks {
    keyboard: Mutex<Option<HookThread>>,
    mouse: Mutex<Option<HookThread>>,
}

impl InputHooks for LowLevelHooks {
    fn install_keyboard(&self, handler: KeyboardHandler) -> PlatformResult<()> {
        let mut thread = lock(&self.keyboard);
        set_slot(&KEYBOARD, Some(handler));
        if thread.is_none() {
            match HookThread::spawn("keyboard-hook", WH_KEYBOARD_LL, Some(keyboard_proc)) {
                Ok(spawned) => *thread = Some(spawned),
                Err(e) => {
                    set_slot(&KEYBOARD, None);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn uninstall_keyboard(&self) -> PlatformResult<()> {
        let thread = lock(&self.keyboard).take();
        set_slot(&KEYBOARD, None);
        match thread {
            Some(thread) => thread.stop(),
            None => Ok(()),
        }
    }

    fn install_mouse(&self, handler: MouseHandler) -> PlatformResult<()> {
        let mut thread = lock(&self.mouse);
        set_slot(&MOUSE, Some(handler));
        if thread.is_none() {
            match HookThread::spawn("mouse-hook", WH_MOUSE_LL, Some(mouse_proc)) {
                Ok(spawned) => *thread = Some(spawned),
                Err(e) => {
                    set_slot(&MOUSE, None);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn uninstall_mouse(&self) -> PlatformResult<()> {
        let thread = lock(&self.mouse).take();
        set_slot(&MOUSE, None);
        SUPPRESSED_X.store(0, Ordering::SeqCst);
        match thread {
            Some(thread) => thread.stop(),
            None => Ok(()),
        }
    }
}
