use serde_json::Value as JsonValue;

use super::registry::{ObjectId, ObjectRegistry, Registration};

/// Placeholder in [`BRIDGE_BOOTSTRAP`] for the transport binding name.
const BINDING_PLACEHOLDER: &str = "__BRIDGE_BINDING__";

/// Output of one compilation pass.
pub struct CompiledScript {
    pub script: String,
    /// Registry changes caused by re-walking the roots.
    pub registration: Registration,
}

/// Builds the script installed to run before every page load.
#[derive(Debug, Clone)]
pub struct InitScriptCompiler {
    binding_name: String,
}

impl InitScriptCompiler {
    pub fn new(binding_name: impl Into<String>) -> Self {
        Self {
            binding_name: binding_name.into(),
        }
    }

    pub fn binding_name(&self) -> &str {
        &self.binding_name
    }

    /// The stub runtime on its own, with the binding name substituted.
    pub fn bootstrap(&self) -> String {
        BRIDGE_BOOTSTRAP.replace(BINDING_PLACEHOLDER, &js_string(&self.binding_name))
    }

    /// Bootstrap followed by the statements of every registered root.
    ///
    /// Roots are re-walked, so children swapped since the last pass are
    /// re-registered before their statements are emitted.
    pub fn compile(&self, registry: &ObjectRegistry) -> CompiledScript {
        self.assemble(registry.refresh_roots())
    }

    /// Bootstrap followed by every registered path as it stands, parents
    /// first. Nothing is walked, so the registry is left untouched.
    pub fn compile_registered(&self, registry: &ObjectRegistry) -> CompiledScript {
        self.assemble(Registration {
            statements: registry.statements_by_path(),
            paths: registry.paths(),
            ..Registration::default()
        })
    }

    fn assemble(&self, registration: Registration) -> CompiledScript {
        let mut script = self.bootstrap();
        for statement in &registration.statements {
            script.push('\n');
            script.push_str(statement);
        }
        script.push('\n');
        tracing::debug!(
            target: "bridge",
            statements = registration.statements.len(),
            bytes = script.len(),
            "compiled init script"
        );
        CompiledScript {
            script,
            registration,
        }
    }
}

pub(crate) fn define_object(path: &str, id: &ObjectId) -> String {
    format!(
        "window.Bridge.__internal.defineObject({},{});",
        js_string(path),
        js_string(id.as_str())
    )
}

// Paths are validated identifiers, so direct member access is safe and
// reaches nested stubs through their parents.
pub(crate) fn define_function(path: &str, name: &str, id: &ObjectId) -> String {
    format!(
        "window.{path}.__internal.defineFunction({},{});",
        js_string(name),
        js_string(id.as_str())
    )
}

pub(crate) fn define_property(path: &str, name: &str) -> String {
    format!(
        "window.{path}.__internal.defineProperty({});",
        js_string(name)
    )
}

pub(crate) fn undefine_object(path: &str) -> String {
    format!(
        "window.Bridge.__internal.undefineObject({});",
        js_string(path)
    )
}

pub(crate) fn broadcast(channel: &str, data: &JsonValue) -> String {
    format!(
        "window.Bridge.__internal.broadcast({},{});",
        js_string(channel),
        data
    )
}

pub(crate) fn console_log(message: &str) -> String {
    format!("console.log('[bridge]', {});", js_string(message))
}

pub(crate) fn mutation_channel(id: &ObjectId, property: &str) -> String {
    format!("__internal:mut:{}:{}", id.as_str(), property)
}

fn js_string(value: &str) -> String {
    JsonValue::String(value.to_string()).to_string()
}

/// Script-side stub runtime.
///
/// Guarded so that a second injection on the same page is a no-op; stub
/// definitions that follow it overwrite earlier ones by path.
pub const BRIDGE_BOOTSTRAP: &str = r#"
(() => {
    if (window.Bridge) {
        return;
    }

    const bindingName = __BRIDGE_BINDING__;
    const transport = window[bindingName];
    try {
        delete window[bindingName];
    } catch (err) {
        // Bindings may be non-configurable on some surfaces.
    }

    const listeners = {};
    const objects = {};
    let nextListenerId = 1;

    const hasOwn = (target, key) => Object.prototype.hasOwnProperty.call(target, key);

    const forgetSubtree = (path) => {
        for (const key of Object.keys(objects)) {
            if (key === path || key.startsWith(path + ".")) {
                delete objects[key];
            }
        }
    };

    const resolveParent = (parts) => {
        let node = window;
        for (const part of parts) {
            if (node === undefined || node === null || !hasOwn(node, part)) {
                return undefined;
            }
            node = node[part];
        }
        return node;
    };

    const notify = (callback, args) => {
        try {
            callback(...args);
        } catch (err) {
            console.error("[bridge]", "A listener produced an exception:", err);
        }
    };

    const Bridge = {
        on(type, callback) {
            if (typeof type !== "string" || typeof callback !== "function") {
                throw new TypeError("`type` must be a string and `callback` must be a function.");
            }
            const key = type.toLowerCase();
            const callbackId = nextListenerId++;
            const callbacks = listeners[key] || {};
            callbacks[callbackId] = callback;
            listeners[key] = callbacks;

            return () => {
                const current = listeners[key];
                if (current) {
                    delete current[callbackId];
                    if (Object.keys(current).length === 0) {
                        delete listeners[key];
                    }
                }
            };
        },

        once(type, callback) {
            const off = Bridge.on(type, (value) => {
                off();
                callback(value);
            });
            return off;
        },

        __internal: {
            listeners,
            objects,

            send(type, data) {
                if (typeof transport !== "function") {
                    return Promise.reject(new Error("bridge transport is not bound"));
                }
                return transport(type, data);
            },

            defineObject(path, id) {
                const parts = path.split(".");
                const name = parts.pop();
                const parent = resolveParent(parts);
                if (parent === undefined || parent === null) {
                    throw new Error("cannot define " + path + ": parent is not defined");
                }

                forgetSubtree(path);
                const record = { id, functions: [], properties: [] };
                objects[path] = record;

                const target = {};
                let proxy;

                Object.defineProperty(target, "__internal", {
                    value: Object.freeze({
                        id,
                        path,
                        defineFunction(functionName) {
                            Object.defineProperty(target, functionName, {
                                value: function (...args) {
                                    return Bridge.__internal.invoke(id, functionName, args);
                                },
                                enumerable: true,
                                configurable: true,
                            });
                            if (!record.functions.includes(functionName)) {
                                record.functions.push(functionName);
                            }
                        },
                        defineProperty(propertyName) {
                            if (!record.properties.includes(propertyName)) {
                                record.properties.push(propertyName);
                            }
                        },
                    }),
                });

                Object.defineProperty(target, "__stores", {
                    value: Object.freeze({
                        svelte(field) {
                            return {
                                subscribe(callback) {
                                    return Bridge.__internal.mutate(id, field, callback);
                                },
                                set(value) {
                                    proxy[field] = value;
                                },
                            };
                        },
                    }),
                });

                proxy = new Proxy(target, {
                    get(obj, property) {
                        if (typeof property !== "string" || hasOwn(obj, property)) {
                            return obj[property];
                        }
                        if (property === "then") {
                            return undefined;
                        }
                        return Bridge.__internal.get(id, property);
                    },
                    set(obj, property, value) {
                        if (typeof property !== "string" || hasOwn(obj, property)) {
                            return false;
                        }
                        Bridge.__internal.set(id, property, value).catch((err) => {
                            console.error("[bridge]", "SET " + property + " failed:", err);
                        });
                        return true;
                    },
                });

                Object.defineProperty(parent, name, {
                    value: proxy,
                    enumerable: true,
                    writable: true,
                    configurable: true,
                });
            },

            undefineObject(path) {
                const parts = path.split(".");
                const name = parts.pop();
                const parent = resolveParent(parts);
                if (parent !== undefined && parent !== null && hasOwn(parent, name)) {
                    delete parent[name];
                }
                forgetSubtree(path);
            },

            get(id, property) {
                return Bridge.__internal.send("GET", { id, property });
            },

            set(id, property, newValue) {
                return Bridge.__internal.send("SET", { id, property, newValue });
            },

            invoke(id, func, args) {
                return Bridge.__internal.send("INVOKE", { id, "function": func, "arguments": args });
            },

            mutate(id, property, callback) {
                const off = Bridge.on(`__internal:mut:${id}:${property}`, callback);
                Bridge.__internal.get(id, property).then(callback, (err) => {
                    console.error("[bridge]", "initial GET " + property + " failed:", err);
                });
                return off;
            },

            broadcast(type, data) {
                const key = type.toLowerCase();
                const wildcard = listeners["*"];
                if (wildcard) {
                    Object.values(wildcard).forEach((callback) => notify(callback, [key, data]));
                }
                const callbacks = listeners[key];
                if (callbacks) {
                    Object.values(callbacks).forEach((callback) => notify(callback, [data]));
                }
            },

            snapshot() {
                const graph = Object.keys(objects).sort().map((path) => {
                    const record = objects[path];
                    const parts = path.split(".");
                    const name = parts.pop();
                    const parent = resolveParent(parts);
                    const node = parent !== undefined && parent !== null && hasOwn(parent, name)
                        ? parent[name]
                        : undefined;
                    return {
                        path,
                        id: record.id,
                        attached: node !== undefined && node.__internal !== undefined
                            && node.__internal.id === record.id,
                        functions: record.functions.slice().sort(),
                        properties: record.properties.slice().sort(),
                    };
                });
                const counts = {};
                for (const key of Object.keys(listeners).sort()) {
                    counts[key] = Object.keys(listeners[key]).length;
                }
                return JSON.stringify({ objects: graph, listeners: counts });
            },
        },
    };

    Object.freeze(Bridge.__internal);
    Object.freeze(Bridge);
    Object.defineProperty(window, "Bridge", {
        value: Bridge,
        writable: false,
        configurable: false,
    });

    console.log("[bridge]", "Injected bridge script.");
    Bridge.__internal.send("INIT", {}).catch((err) => {
        console.error("[bridge]", "INIT failed:", err);
    });
})();
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bootstrap_embeds_binding_name() {
        let compiler = InitScriptCompiler::new("__hostChannel");
        let script = compiler.bootstrap();
        assert!(script.contains(r#"const bindingName = "__hostChannel";"#));
        assert!(!script.contains(BINDING_PLACEHOLDER));
    }

    #[test]
    fn statements_quote_names() {
        let id = ObjectId::from("abc");
        assert_eq!(
            define_object("Test.nested", &id),
            r#"window.Bridge.__internal.defineObject("Test.nested","abc");"#
        );
        assert_eq!(
            define_function("Test", "ring\"Bell", &id),
            r#"window.Test.__internal.defineFunction("ring\"Bell","abc");"#
        );
        assert_eq!(
            broadcast("__internal:mut:abc:count", &json!({"n": 1})),
            r#"window.Bridge.__internal.broadcast("__internal:mut:abc:count",{"n":1});"#
        );
    }

    #[test]
    fn empty_registry_compiles_to_bootstrap() {
        let compiler = InitScriptCompiler::new("__bridgeInternal");
        let registry = ObjectRegistry::new();
        let compiled = compiler.compile(&registry);
        assert_eq!(compiled.script, format!("{}\n", compiler.bootstrap()));
        assert!(compiled.registration.is_empty());
    }
}
