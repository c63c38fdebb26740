//! JNI bindings that let `MainService` drive the session from Java.
//!
//! `vncInit` caches the Java VM and the service classes, builds the event bridge and the
//! process-wide [`Session`]. All other entry points forward to that session and map
//! failures to `JNI_FALSE`, `0`, `-1` or `null` after logging them.

use jni::objects::{GlobalRef, JClass, JObject, JString, JValue};
use jni::sys::{jboolean, jint, jlong, jstring, JNI_FALSE, JNI_TRUE};
use jni::{JNIEnv, JavaVM};
use log::{error, info, warn};
use once_cell::sync::OnceCell;
use std::sync::Arc;

use crate::bridge::{EventBridge, HostHandlers, HostRuntime, NativeRuntime};
use crate::config::{ListenPort, SessionConfig};
use crate::error::BridgeError;
use crate::session::Session;
use crate::vnc::events::ClientId;

/// Global reference to the Java VM.
static JAVA_VM: OnceCell<JavaVM> = OnceCell::new();
/// The session all entry points operate on.
static SESSION: OnceCell<Session> = OnceCell::new();

const INPUT_SERVICE_CLASS: &str = "net/christianbeier/droidvnc_ng/InputService";
const MAIN_SERVICE_CLASS: &str = "net/christianbeier/droidvnc_ng/MainService";

/// Binds engine worker threads to the JVM.
struct JvmRuntime {
    vm: &'static JavaVM,
}

impl HostRuntime for JvmRuntime {
    fn is_attached(&self) -> bool {
        self.vm.get_env().is_ok()
    }

    fn attach_current_thread(&self) -> Result<(), BridgeError> {
        self.vm
            .attach_current_thread_permanently()
            .map(|_| ())
            .map_err(|e| BridgeError::AttachFailed(e.to_string()))
    }

    fn detach_current_thread(&self) {
        // SAFETY: only called by a runtime scope that attached this thread itself, after
        // the handler returned, so no JNIEnv or local reference from it is still alive.
        unsafe { self.vm.detach_current_thread() };
    }
}

/// Static callbacks on `InputService` and `MainService`.
struct JavaHandlers {
    vm: &'static JavaVM,
    input_service: Option<GlobalRef>,
    main_service: Option<GlobalRef>,
}

impl JavaHandlers {
    fn invoke(
        &self,
        class: Option<&GlobalRef>,
        method: &str,
        call: impl FnOnce(&mut JNIEnv, &GlobalRef) -> jni::errors::Result<()>,
    ) {
        let Some(class) = class else {
            return;
        };
        let mut env = match self.vm.get_env() {
            Ok(env) => env,
            Err(e) => {
                error!("No JNI environment for {}: {}", method, e);
                return;
            }
        };

        if let Err(e) = call(&mut env, class) {
            error!("Failed to call {}: {}", method, e);
        }
        if env.exception_check().unwrap_or(false) {
            let _ = env.exception_describe();
            let _ = env.exception_clear();
        }
    }
}

impl HostHandlers for JavaHandlers {
    fn on_pointer_event(&self, button_mask: u8, x: u16, y: u16, client: ClientId) {
        self.invoke(self.input_service.as_ref(), "onPointerEvent", |env, class| {
            let args = [
                JValue::Int(jint::from(button_mask)),
                JValue::Int(jint::from(x)),
                JValue::Int(jint::from(y)),
                JValue::Long(client.get() as jlong),
            ];
            env.call_static_method(class, "onPointerEvent", "(IIIJ)V", &args)
                .map(|_| ())
        });
    }

    fn on_key_event(&self, down: bool, keysym: u32, client: ClientId) {
        self.invoke(self.input_service.as_ref(), "onKeyEvent", |env, class| {
            let args = [
                JValue::Int(jint::from(down)),
                JValue::Long(jlong::from(keysym)),
                JValue::Long(client.get() as jlong),
            ];
            env.call_static_method(class, "onKeyEvent", "(IJJ)V", &args)
                .map(|_| ())
        });
    }

    fn on_cut_text(&self, text: &str, client: ClientId) {
        self.invoke(self.input_service.as_ref(), "onCutText", |env, class| {
            let jtext = env.new_string(text)?;
            let result = env
                .call_static_method(
                    class,
                    "onCutText",
                    "(Ljava/lang/String;J)V",
                    &[JValue::Object(&jtext), JValue::Long(client.get() as jlong)],
                )
                .map(|_| ());
            // Attached threads never return to Java, so local refs must go explicitly.
            env.delete_local_ref(jtext)?;
            result
        });
    }

    fn on_client_connected(&self, client: ClientId) {
        info!("Client {} connected", client);
        self.invoke(self.main_service.as_ref(), "onClientConnected", |env, class| {
            env.call_static_method(
                class,
                "onClientConnected",
                "(J)V",
                &[JValue::Long(client.get() as jlong)],
            )
            .map(|_| ())
        });
    }

    fn on_client_disconnected(&self, client: ClientId) {
        info!("Client {} disconnected", client);
        self.invoke(self.main_service.as_ref(), "onClientDisconnected", |env, class| {
            env.call_static_method(
                class,
                "onClientDisconnected",
                "(J)V",
                &[JValue::Long(client.get() as jlong)],
            )
            .map(|_| ())
        });
    }
}

#[cfg(target_os = "android")]
fn init_logging() {
    android_logger::init_once(
        android_logger::Config::default()
            .with_max_level(log::LevelFilter::Info)
            .with_tag("DroidVNC-Rust"),
    );
}

#[cfg(not(target_os = "android"))]
fn init_logging() {}

fn global_class(env: &mut JNIEnv, name: &str) -> Option<GlobalRef> {
    let result = env
        .find_class(name)
        .and_then(|class| env.new_global_ref(class));
    match result {
        Ok(global) => Some(global),
        Err(e) => {
            // A failed lookup leaves NoClassDefFoundError pending.
            let _ = env.exception_clear();
            error!("Failed to resolve {}: {}", name, e);
            None
        }
    }
}

fn build_bridge(env: &mut JNIEnv) -> EventBridge {
    let vm = match env.get_java_vm() {
        Ok(vm) => JAVA_VM.get_or_init(|| vm),
        Err(e) => {
            error!("Failed to get Java VM: {}", e);
            return EventBridge::new(Arc::new(NativeRuntime), None);
        }
    };

    let input_service = global_class(env, INPUT_SERVICE_CLASS);
    let main_service = global_class(env, MAIN_SERVICE_CLASS);
    let handlers: Option<Arc<dyn HostHandlers>> =
        if input_service.is_none() && main_service.is_none() {
            None
        } else {
            Some(Arc::new(JavaHandlers {
                vm,
                input_service,
                main_service,
            }))
        };

    EventBridge::new(Arc::new(JvmRuntime { vm }), handlers)
}

fn session() -> Option<&'static Session> {
    let session = SESSION.get();
    if session.is_none() {
        error!("vncInit has not been called");
    }
    session
}

fn get_string(env: &mut JNIEnv, value: &JString, what: &str) -> Option<String> {
    if value.is_null() {
        return None;
    }
    match env.get_string(value) {
        Ok(s) => Some(s.into()),
        Err(e) => {
            error!("Failed to get {}: {}", what, e);
            None
        }
    }
}

fn client_id(raw: jlong) -> Option<ClientId> {
    u64::try_from(raw).ok().filter(|&id| id != 0).map(ClientId)
}

fn new_jstring(env: &mut JNIEnv, value: &str) -> jstring {
    match env.new_string(value) {
        Ok(s) => s.into_raw(),
        Err(e) => {
            error!("Failed to create Java string: {}", e);
            std::ptr::null_mut()
        }
    }
}

fn jni_bool(value: bool) -> jboolean {
    if value {
        JNI_TRUE
    } else {
        JNI_FALSE
    }
}

/// JNI entry point to initialize the Rust side.
///
/// Resolves the Java VM and the service classes once per process and creates the session.
/// Must run before any other entry point; later calls are no-ops.
#[no_mangle]
#[allow(non_snake_case)]
pub extern "system" fn Java_net_christianbeier_droidvnc_1ng_MainService_vncInit(
    mut env: JNIEnv,
    _class: JClass,
) {
    init_logging();

    if SESSION.get().is_some() {
        return;
    }
    info!("Initializing Rust VNC session");

    let bridge = build_bridge(&mut env);
    if SESSION.set(Session::new(bridge)).is_err() {
        warn!("Session initialized concurrently");
    }
    info!("Rust VNC session initialized");
}

/// JNI entry point to start the VNC server.
///
/// # Arguments
///
/// * `width`, `height` - Framebuffer dimensions, 1 to 8192.
/// * `port` - The TCP port to listen on, or `-1` to serve only outbound connections.
/// * `desktop_name` - The name announced to viewers.
/// * `password` - The VNC password; `null` or empty disables authentication.
///
/// # Returns
///
/// `JNI_TRUE` if the server started, `JNI_FALSE` otherwise.
#[no_mangle]
#[allow(non_snake_case)]
pub extern "system" fn Java_net_christianbeier_droidvnc_1ng_MainService_vncStartServer(
    mut env: JNIEnv,
    _class: JClass,
    width: jint,
    height: jint,
    port: jint,
    desktop_name: JString,
    password: JString,
) -> jboolean {
    let Some(session) = session() else {
        return JNI_FALSE;
    };

    let (Ok(width), Ok(height)) = (u32::try_from(width), u32::try_from(height)) else {
        error!("Invalid framebuffer size {}x{}", width, height);
        return JNI_FALSE;
    };
    let port = match ListenPort::from_raw(port) {
        Ok(port) => port,
        Err(e) => {
            error!("{}", e);
            return JNI_FALSE;
        }
    };
    let Some(desktop_name) = get_string(&mut env, &desktop_name, "desktop name") else {
        return JNI_FALSE;
    };
    let password = get_string(&mut env, &password, "password");

    let config = SessionConfig::new(width, height)
        .with_port(port)
        .with_desktop_name(desktop_name)
        .with_password(password);

    jni_bool(session.start(config).is_ok())
}

/// JNI entry point to stop the VNC server.
///
/// Blocks until every client is disconnected.
#[no_mangle]
#[allow(non_snake_case)]
pub extern "system" fn Java_net_christianbeier_droidvnc_1ng_MainService_vncStopServer(
    _env: JNIEnv,
    _class: JClass,
) -> jboolean {
    let Some(session) = session() else {
        return JNI_FALSE;
    };
    match session.stop() {
        Ok(()) => JNI_TRUE,
        Err(e) => {
            error!("Failed to stop session: {}", e);
            JNI_FALSE
        }
    }
}

#[no_mangle]
#[allow(non_snake_case)]
pub extern "system" fn Java_net_christianbeier_droidvnc_1ng_MainService_vncIsActive(
    _env: JNIEnv,
    _class: JClass,
) -> jboolean {
    jni_bool(SESSION.get().map_or(false, Session::is_active))
}

/// JNI entry point to replace the framebuffer contents with a new frame.
///
/// # Arguments
///
/// * `buffer` - A direct `ByteBuffer` holding exactly `width * height * 4` RGBA bytes.
///
/// # Returns
///
/// `JNI_TRUE` if the frame was copied in, `JNI_FALSE` if the session is not running or
/// the buffer size does not match.
#[no_mangle]
#[allow(non_snake_case)]
pub extern "system" fn Java_net_christianbeier_droidvnc_1ng_MainService_vncUpdateFramebuffer(
    env: JNIEnv,
    _class: JClass,
    buffer: JObject,
) -> jboolean {
    let Some(session) = session() else {
        return JNI_FALSE;
    };

    let buffer_ptr = match env.get_direct_buffer_address((&buffer).into()) {
        Ok(ptr) if !ptr.is_null() => ptr,
        Ok(_) => {
            error!("Framebuffer update buffer is not direct");
            return JNI_FALSE;
        }
        Err(e) => {
            error!("Failed to get buffer address: {}", e);
            return JNI_FALSE;
        }
    };
    let buffer_capacity = match env.get_direct_buffer_capacity((&buffer).into()) {
        Ok(cap) => cap,
        Err(e) => {
            error!("Failed to get buffer capacity: {}", e);
            return JNI_FALSE;
        }
    };

    // SAFETY: direct buffer memory is not moved by the GC, and `buffer` keeps it alive for
    // the duration of this call. The slice does not outlive the call.
    let data = unsafe { std::slice::from_raw_parts(buffer_ptr, buffer_capacity) };

    match session.update_frame(data) {
        Ok(()) => JNI_TRUE,
        Err(e) => {
            error!("Failed to update framebuffer: {}", e);
            JNI_FALSE
        }
    }
}

/// JNI entry point to resize the framebuffer.
///
/// The new framebuffer is zeroed; the host is expected to follow up with a full frame.
#[no_mangle]
#[allow(non_snake_case)]
pub extern "system" fn Java_net_christianbeier_droidvnc_1ng_MainService_vncNewFramebuffer(
    _env: JNIEnv,
    _class: JClass,
    width: jint,
    height: jint,
) -> jboolean {
    let Some(session) = session() else {
        return JNI_FALSE;
    };
    let (Ok(width), Ok(height)) = (u32::try_from(width), u32::try_from(height)) else {
        error!("Invalid framebuffer size {}x{}", width, height);
        return JNI_FALSE;
    };

    match session.resize(width, height) {
        Ok(()) => JNI_TRUE,
        Err(e) => {
            error!("Failed to resize framebuffer: {}", e);
            JNI_FALSE
        }
    }
}

/// Returns the framebuffer width in pixels, or -1 if the server is not active.
#[no_mangle]
#[allow(non_snake_case)]
pub extern "system" fn Java_net_christianbeier_droidvnc_1ng_MainService_vncGetFramebufferWidth(
    _env: JNIEnv,
    _class: JClass,
) -> jint {
    SESSION
        .get()
        .and_then(Session::frame_size)
        .map_or(-1, |(width, _)| jint::from(width))
}

/// Returns the framebuffer height in pixels, or -1 if the server is not active.
#[no_mangle]
#[allow(non_snake_case)]
pub extern "system" fn Java_net_christianbeier_droidvnc_1ng_MainService_vncGetFramebufferHeight(
    _env: JNIEnv,
    _class: JClass,
) -> jint {
    SESSION
        .get()
        .and_then(Session::frame_size)
        .map_or(-1, |(_, height)| jint::from(height))
}

/// JNI entry point to send clipboard text to all connected viewers.
#[no_mangle]
#[allow(non_snake_case)]
pub extern "system" fn Java_net_christianbeier_droidvnc_1ng_MainService_vncSendCutText(
    mut env: JNIEnv,
    _class: JClass,
    text: JString,
) {
    let Some(session) = session() else {
        return;
    };
    let Some(text) = get_string(&mut env, &text, "cut text") else {
        return;
    };
    if let Err(e) = session.send_cut_text(&text) {
        error!("Failed to send cut text: {}", e);
    }
}

/// JNI entry point to connect to a viewer in listening mode.
///
/// Blocks until the connection succeeds or fails; call it off the main thread.
///
/// # Returns
///
/// The client ID of the new connection, or `0` on failure.
#[no_mangle]
#[allow(non_snake_case)]
pub extern "system" fn Java_net_christianbeier_droidvnc_1ng_MainService_vncConnectReverse(
    mut env: JNIEnv,
    _class: JClass,
    host: JString,
    port: jint,
) -> jlong {
    let Some(session) = session() else {
        return 0;
    };
    let Some(host) = get_string(&mut env, &host, "reverse connection host") else {
        return 0;
    };
    let Ok(port) = u16::try_from(port) else {
        error!("Invalid reverse connection port {}", port);
        return 0;
    };

    match session.connect_reverse(&host, port) {
        Ok(id) => id.get() as jlong,
        Err(e) => {
            error!("Failed to establish reverse connection: {}", e);
            0
        }
    }
}

/// JNI entry point to register with a VNC repeater.
///
/// Blocks until the connection succeeds or fails; call it off the main thread.
///
/// # Arguments
///
/// * `host` - The hostname or IP address of the repeater.
/// * `port` - The port of the repeater.
/// * `repeater_id` - The ID viewers use to find this server, at most 247 bytes.
///
/// # Returns
///
/// The client ID of the new connection, or `0` on failure.
#[no_mangle]
#[allow(non_snake_case)]
pub extern "system" fn Java_net_christianbeier_droidvnc_1ng_MainService_vncConnectRepeater(
    mut env: JNIEnv,
    _class: JClass,
    host: JString,
    port: jint,
    repeater_id: JString,
) -> jlong {
    let Some(session) = session() else {
        return 0;
    };
    let Some(host) = get_string(&mut env, &host, "repeater host") else {
        return 0;
    };
    let Some(repeater_id) = get_string(&mut env, &repeater_id, "repeater ID") else {
        return 0;
    };
    let Ok(port) = u16::try_from(port) else {
        error!("Invalid repeater port {}", port);
        return 0;
    };

    match session.connect_via_repeater(&host, port, &repeater_id) {
        Ok(id) => id.get() as jlong,
        Err(e) => {
            error!("Failed to connect to repeater: {}", e);
            0
        }
    }
}

/// Returns the remote host of a client, or `null` if it is not connected.
#[no_mangle]
#[allow(non_snake_case)]
pub extern "system" fn Java_net_christianbeier_droidvnc_1ng_MainService_vncGetRemoteHost(
    mut env: JNIEnv,
    _class: JClass,
    client: jlong,
) -> jstring {
    let info = client_id(client).and_then(|id| SESSION.get()?.client_info(id));
    match info {
        Some(info) => new_jstring(&mut env, &info.host),
        None => std::ptr::null_mut(),
    }
}

/// Returns the port dialled for an outbound client, or -1 for inbound or unknown clients.
#[no_mangle]
#[allow(non_snake_case)]
pub extern "system" fn Java_net_christianbeier_droidvnc_1ng_MainService_vncGetDestinationPort(
    _env: JNIEnv,
    _class: JClass,
    client: jlong,
) -> jint {
    client_id(client)
        .and_then(|id| SESSION.get()?.client_info(id))
        .and_then(|info| info.destination_port)
        .map_or(-1, jint::from)
}

/// Returns the repeater ID a client was registered under, or `null`.
#[no_mangle]
#[allow(non_snake_case)]
pub extern "system" fn Java_net_christianbeier_droidvnc_1ng_MainService_vncGetRepeaterId(
    mut env: JNIEnv,
    _class: JClass,
    client: jlong,
) -> jstring {
    let repeater_id = client_id(client)
        .and_then(|id| SESSION.get()?.client_info(id))
        .and_then(|info| info.repeater_id);
    match repeater_id {
        Some(id) => new_jstring(&mut env, &id),
        None => std::ptr::null_mut(),
    }
}

/// JNI entry point to disconnect a single client.
///
/// # Returns
///
/// `JNI_TRUE` if the client was connected and is now being closed.
#[no_mangle]
#[allow(non_snake_case)]
pub extern "system" fn Java_net_christianbeier_droidvnc_1ng_MainService_vncDisconnect(
    _env: JNIEnv,
    _class: JClass,
    client: jlong,
) -> jboolean {
    let (Some(session), Some(id)) = (session(), client_id(client)) else {
        return JNI_FALSE;
    };
    match session.disconnect_client(id) {
        Ok(found) => jni_bool(found),
        Err(e) => {
            error!("Failed to disconnect client {}: {}", id, e);
            JNI_FALSE
        }
    }
}
