//! Mutable tree walker over `ast`.
//!
//! Implementors override the hooks they care about and call the matching
//! `walk_*` function to keep descending. The defaults visit everything,
//! including fields, properties and annotations; rewriting passes that must
//! not touch those override the hook with an empty body.

use std::sync::Arc;

use crate::ast::{
    Annotation, Block, ClassDecl, Closure, Expr, FieldDecl, MethodDecl, Program, Stmt,
};

pub trait VisitMut {
    fn visit_program(&mut self, program: &mut Program) {
        walk_program(self, program);
    }

    fn visit_class(&mut self, class: &mut ClassDecl) {
        walk_class(self, class);
    }

    fn visit_annotations(&mut self, annotations: &mut Vec<Annotation>) {
        for annotation in annotations {
            for (_, value) in &mut annotation.members {
                self.visit_expr(value);
            }
        }
    }

    fn visit_field(&mut self, field: &mut FieldDecl) {
        walk_field(self, field);
    }

    fn visit_property(&mut self, property: &mut FieldDecl) {
        walk_field(self, property);
    }

    fn visit_method(&mut self, method: &mut MethodDecl) {
        walk_method(self, method);
    }

    fn visit_block(&mut self, block: &mut Block) {
        walk_block(self, block);
    }

    fn visit_stmt(&mut self, stmt: &mut Stmt) {
        walk_stmt(self, stmt);
    }

    fn visit_closure(&mut self, closure: &mut Closure) {
        walk_closure(self, closure);
    }

    fn visit_expr(&mut self, expr: &mut Expr) {
        walk_expr(self, expr);
    }
}

pub fn walk_program<V: VisitMut + ?Sized>(v: &mut V, program: &mut Program) {
    for class in &mut program.classes {
        v.visit_class(class);
    }
}

pub fn walk_class<V: VisitMut + ?Sized>(v: &mut V, class: &mut ClassDecl) {
    v.visit_annotations(&mut class.annotations);
    for field in &mut class.fields {
        v.visit_field(field);
    }
    for property in &mut class.properties {
        v.visit_property(property);
    }
    for method in &mut class.methods {
        v.visit_method(method);
    }
}

pub fn walk_field<V: VisitMut + ?Sized>(v: &mut V, field: &mut FieldDecl) {
    v.visit_annotations(&mut field.annotations);
    if let Some(init) = &mut field.init {
        v.visit_expr(init);
    }
}

pub fn walk_method<V: VisitMut + ?Sized>(v: &mut V, method: &mut MethodDecl) {
    v.visit_annotations(&mut method.annotations);
    if let Some(body) = &mut method.body {
        v.visit_block(body);
    }
}

pub fn walk_block<V: VisitMut + ?Sized>(v: &mut V, block: &mut Block) {
    for stmt in &mut block.stmts {
        v.visit_stmt(stmt);
    }
}

pub fn walk_closure<V: VisitMut + ?Sized>(v: &mut V, closure: &mut Closure) {
    v.visit_block(Arc::make_mut(&mut closure.body));
}

pub fn walk_stmt<V: VisitMut + ?Sized>(v: &mut V, stmt: &mut Stmt) {
    match stmt {
        Stmt::Expr(e) | Stmt::Throw(e) => v.visit_expr(e),
        Stmt::Let { init, .. } => {
            if let Some(e) = init {
                v.visit_expr(e);
            }
        }
        Stmt::Assign { value, .. } => v.visit_expr(value),
        Stmt::IndexAssign {
            target,
            index,
            value,
        } => {
            v.visit_expr(target);
            v.visit_expr(index);
            v.visit_expr(value);
        }
        Stmt::If {
            cond,
            then,
            otherwise,
        } => {
            v.visit_expr(cond);
            v.visit_block(then);
            if let Some(b) = otherwise {
                v.visit_block(b);
            }
        }
        Stmt::For {
            init,
            cond,
            update,
            body,
        } => {
            if let Some(s) = init {
                v.visit_stmt(s);
            }
            if let Some(e) = cond {
                v.visit_expr(e);
            }
            if let Some(s) = update {
                v.visit_stmt(s);
            }
            v.visit_stmt(body);
        }
        Stmt::While { cond, body } => {
            v.visit_expr(cond);
            v.visit_stmt(body);
        }
        Stmt::DoWhile { body, cond } => {
            v.visit_stmt(body);
            v.visit_expr(cond);
        }
        Stmt::Return(e) => {
            if let Some(e) = e {
                v.visit_expr(e);
            }
        }
        Stmt::Block(b) => v.visit_block(b),
        Stmt::Break | Stmt::Continue | Stmt::QuotaInit(_) | Stmt::QuotaCheck => {}
    }
}

pub fn walk_expr<V: VisitMut + ?Sized>(v: &mut V, expr: &mut Expr) {
    match expr {
        Expr::Null | Expr::Bool(_) | Expr::Int(_) | Expr::Str(_) | Expr::Var(_) => {}
        Expr::Unary { expr, .. } => v.visit_expr(expr),
        Expr::Binary { lhs, rhs, .. } => {
            v.visit_expr(lhs);
            v.visit_expr(rhs);
        }
        Expr::Call { args, .. } => {
            for a in args {
                v.visit_expr(a);
            }
        }
        Expr::CallValue { callee, args } => {
            v.visit_expr(callee);
            for a in args {
                v.visit_expr(a);
            }
        }
        Expr::Closure(c) => v.visit_closure(c),
        Expr::NewBytes(len) => v.visit_expr(len),
        Expr::Index { target, index } => {
            v.visit_expr(target);
            v.visit_expr(index);
        }
        Expr::Len(e) => v.visit_expr(e),
    }
}
