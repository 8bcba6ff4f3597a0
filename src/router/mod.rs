//! # Sistema de Routing
//! src/router/mod.rs
//!
//! Mapea `(método, path)` a handlers. Los handlers reciben además un
//! contexto compartido (el nodo), así la tabla de rutas queda estática y
//! sin closures.
//!
//! ```text
//! Request → Router → Handler(&Request, &Contexto) → Response
//! ```
//!
//! Path desconocido → 404. Path conocido con otro método → 405.

use crate::http::{Method, Request, Response, StatusCode};

/// Un handler recibe el request y el contexto y retorna una Response
pub type Handler<C> = fn(&Request, &C) -> Response;

struct Route<C> {
    method: Method,
    path: String,
    handler: Handler<C>,
}

/// Router que mapea `(método, path)` a handlers
pub struct Router<C> {
    routes: Vec<Route<C>>,
}

impl<C> Router<C> {
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    /// Registra una ruta
    ///
    /// # Ejemplo
    /// ```
    /// use factorial_cluster::router::Router;
    /// use factorial_cluster::http::{Method, Request, Response};
    ///
    /// fn status(_req: &Request, name: &String) -> Response {
    ///     Response::json(&format!(r#"{{"node": "{}"}}"#, name))
    /// }
    ///
    /// let mut router: Router<String> = Router::new();
    /// router.register(Method::GET, "/status", status);
    ///
    /// let request = Request::parse(b"GET /status HTTP/1.0\r\n\r\n").unwrap();
    /// let response = router.route(&request, &"node1".to_string());
    /// assert_eq!(response.body(), br#"{"node": "node1"}"#);
    /// ```
    pub fn register(&mut self, method: Method, path: &str, handler: Handler<C>) {
        self.routes.push(Route {
            method,
            path: path.to_string(),
            handler,
        });
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Ejecuta el handler que corresponde al request
    pub fn route(&self, request: &Request, ctx: &C) -> Response {
        let path = request.path();
        let mut path_known = false;

        for route in &self.routes {
            if route.path != path {
                continue;
            }
            if route.method == request.method() {
                let mut response = (route.handler)(request, ctx);
                Self::add_common_headers(&mut response);
                return response;
            }
            path_known = true;
        }

        let mut response = if path_known {
            Response::error(
                StatusCode::MethodNotAllowed,
                &format!("Method {} not allowed on {}", request.method().as_str(), path),
            )
        } else {
            Response::error(StatusCode::NotFound, &format!("Route not found: {}", path))
        };
        Self::add_common_headers(&mut response);
        response
    }

    fn add_common_headers(response: &mut Response) {
        response.add_header("Server", "FactorialCluster-HTTP/1.0");
        response.add_header("Connection", "close");
    }
}

impl<C> Default for Router<C> {
    fn default() -> Self {
        Self::new()
    }
}
